// End-to-end tests: a real upstream registry stub, entitlement provider and
// gateway, all on ephemeral localhost ports.
#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, SocketAddr},
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{
        Json, Router,
        extract::{Path, Request},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use registry_gate::{
        adapters::{
            AppState, HttpAuthProvider, HttpClientAdapter, auth_provider::UrlTemplate, build_router,
            middleware::MetricsAccess,
        },
        core::{
            AuthDecisionCache, AuthEngine, ErrorFormat, Gateway, ResponseCache, StaticAllowList,
            UpstreamTarget,
        },
        metrics::EventEmitter,
        ports::{HealthReporter, HttpClient, HttpClientResult},
    };
    use reqwest::redirect::Policy;
    use tokio::net::TcpListener;

    const DOCKER_UA: &str = "docker/27.1.1 go/go1.22.5 git-commit/cc13f95 kernel/6.8.0 os/linux arch/amd64";

    #[derive(Default)]
    struct RecordingHealth(Mutex<Vec<String>>);

    impl RecordingHealth {
        fn reports(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl HealthReporter for RecordingHealth {
        fn fail(&self, body: String) {
            self.0.lock().unwrap().push(body);
        }
    }

    /// Real upstream client that blows up on one path.
    struct Exploding(HttpClientAdapter);

    #[async_trait]
    impl HttpClient for Exploding {
        async fn send_request(&self, req: Request) -> HttpClientResult<Response> {
            if req.uri().path() == "/v2/app/manifests/explode" {
                panic!("manifest parser exploded");
            }
            self.0.send_request(req).await
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });
        addr
    }

    async fn spawn_registry(hits: Arc<AtomicUsize>) -> SocketAddr {
        let counted = hits.clone();
        let tags = get(move |Path(name): Path<String>| {
            let counted = counted.clone();
            async move {
                if name == "slow" {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                counted.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({ "name": name, "tags": ["1.0", "latest"] }))
            }
        });

        let uploads = post(|headers: HeaderMap| async move {
            let host = headers[header::HOST].to_str().unwrap().to_string();
            (
                StatusCode::ACCEPTED,
                [(
                    header::LOCATION,
                    format!("http://{host}/v2/app/blobs/uploads/3f1c?_state=abc"),
                )],
            )
                .into_response()
        });

        let app = Router::new()
            .route("/v2/", get(|| async { Json(serde_json::json!({})) }))
            .route("/v2/{name}/tags/list", tags)
            .route("/v2/app/blobs/uploads/", uploads)
            .route(
                "/v2/app/manifests/missing",
                get(|| async { (StatusCode::NOT_FOUND, "manifest unknown") }),
            );
        serve(app).await
    }

    async fn spawn_provider(calls: Arc<AtomicUsize>) -> SocketAddr {
        let app = Router::new().route(
            "/targets/{ip}",
            get(move |Path(ip): Path<String>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match ip.as_str() {
                        "203.0.113.10" => (StatusCode::OK, r#"[{"host":"tenant.example"}]"#),
                        "203.0.113.11" => (StatusCode::PAYMENT_REQUIRED, ""),
                        _ => (StatusCode::SERVICE_UNAVAILABLE, "maintenance"),
                    }
                }
            }),
        );
        serve(app).await
    }

    struct Setup {
        upstream: String,
        provider: Option<SocketAddr>,
        cache: bool,
    }

    async fn spawn_gateway(setup: Setup, health: Arc<RecordingHealth>) -> SocketAddr {
        let health: Arc<dyn HealthReporter> = health;
        let allow_list = StaticAllowList::new(
            ["203.0.113.1".parse::<IpAddr>().unwrap()],
            ["127.0.0.1".parse::<IpAddr>().unwrap()],
            ["docker", "containerd"],
        );
        let mut engine = AuthEngine::new(
            allow_list,
            AuthDecisionCache::new(Duration::from_secs(60), 100, 100),
            EventEmitter::disabled(),
        );
        if let Some(provider) = setup.provider {
            let template = UrlTemplate::parse(&format!("http://{provider}/targets/{{ip}}")).unwrap();
            let client =
                HttpAuthProvider::new(template, None, None, Duration::from_secs(2)).unwrap();
            engine = engine.with_provider(Arc::new(client), Duration::from_secs(2));
        }

        let client = HttpClientAdapter::new(Duration::from_secs(1), Duration::from_secs(5)).unwrap();
        let gateway = Gateway::new(
            Arc::new(Exploding(client)),
            UpstreamTarget::new("http", &setup.upstream).unwrap(),
            health.clone(),
            EventEmitter::disabled(),
            ErrorFormat::Json,
        );

        let prometheus = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState {
            auth: Arc::new(engine),
            cache: setup
                .cache
                .then(|| ResponseCache::new(Duration::from_secs(60), 100, 64 * 1024)),
            gateway: Arc::new(gateway),
            health,
            events: EventEmitter::disabled(),
            metrics_access: Arc::new(MetricsAccess::new(
                Some("prom".to_string()),
                Some("scrape".to_string()),
                Vec::<IpAddr>::new(),
            )),
            prometheus: Some(prometheus),
        };
        serve(build_router(state)).await
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap()
    }

    async fn docker_get(gateway: SocketAddr, path: &str, client_ip: &str) -> reqwest::Response {
        client()
            .get(format!("http://{gateway}{path}"))
            .header(header::USER_AGENT, DOCKER_UA)
            .header("x-forwarded-for", client_ip)
            .send()
            .await
            .unwrap()
    }

    async fn standard_gateway() -> (SocketAddr, Arc<AtomicUsize>, Arc<RecordingHealth>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = spawn_registry(hits.clone()).await;
        let health = Arc::new(RecordingHealth::default());
        let gateway = spawn_gateway(
            Setup {
                upstream: registry.to_string(),
                provider: None,
                cache: true,
            },
            health.clone(),
        )
        .await;
        (gateway, hits, health)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tag_listing_is_served_from_cache() {
        let (gateway, hits, _) = standard_gateway().await;

        let first = docker_get(gateway, "/v2/app/tags/list", "198.51.100.20").await;
        assert_eq!(first.status(), reqwest::StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        let first_body = first.text().await.unwrap();
        assert!(first_body.contains("latest"));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = docker_get(gateway, "/v2/app/tags/list", "198.51.100.20").await;
        assert_eq!(second.status(), reqwest::StatusCode::OK);
        assert_eq!(second.headers()["x-cache"], "HIT");
        assert_eq!(second.headers()["x-frame-options"], "SAMEORIGIN");
        assert_eq!(second.text().await.unwrap(), first_body);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn response_is_cached_after_client_gives_up() {
        let (gateway, hits, _) = standard_gateway().await;

        let impatient = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let abandoned = impatient
            .get(format!("http://{gateway}/v2/slow/tags/list"))
            .header(header::USER_AGENT, DOCKER_UA)
            .header("x-forwarded-for", "198.51.100.22")
            .send()
            .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let retry = docker_get(gateway, "/v2/slow/tags/list", "198.51.100.22").await;
        assert_eq!(retry.status(), reqwest::StatusCode::OK);
        assert_eq!(retry.headers()["x-cache"], "HIT");
        assert!(retry.text().await.unwrap().contains("slow"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_responses_are_not_cached() {
        let (gateway, _, health) = standard_gateway().await;

        for _ in 0..2 {
            let response = docker_get(gateway, "/v2/app/manifests/missing", "198.51.100.21").await;
            assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
            assert!(response.headers().get("x-cache").is_none());
        }
        assert!(health.reports().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trusted_push_gets_client_facing_location() {
        let (gateway, _, _) = standard_gateway().await;

        let response = client()
            .post(format!("http://{gateway}/v2/app/blobs/uploads/"))
            .header(header::USER_AGENT, DOCKER_UA)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        assert_eq!(
            response.headers()[header::LOCATION],
            format!("http://{gateway}/v2/app/blobs/uploads/3f1c?_state=abc").as_str()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn untrusted_push_is_forbidden() {
        let (gateway, _, _) = standard_gateway().await;

        let response = client()
            .put(format!("http://{gateway}/v2/app/manifests/latest"))
            .header(header::USER_AGENT, DOCKER_UA)
            .header("x-forwarded-for", "198.51.100.30")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "FORBIDDEN");
        assert!(body["errors"][0]["detail"].is_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_agent_and_method_are_rejected() {
        let (gateway, hits, _) = standard_gateway().await;

        let curl = client()
            .get(format!("http://{gateway}/v2/app/tags/list"))
            .header(header::USER_AGENT, "curl/8.5.0")
            .header("x-forwarded-for", "198.51.100.31")
            .send()
            .await
            .unwrap();
        assert_eq!(curl.status(), reqwest::StatusCode::FORBIDDEN);

        let trace = client()
            .request(
                reqwest::Method::TRACE,
                format!("http://{gateway}/v2/app/tags/list"),
            )
            .header(header::USER_AGENT, DOCKER_UA)
            .header("x-forwarded-for", "198.51.100.32")
            .send()
            .await
            .unwrap();
        assert_eq!(trace.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allow_listed_ip_skips_agent_check() {
        let (gateway, _, _) = standard_gateway().await;

        let response = client()
            .get(format!("http://{gateway}/v2/"))
            .header(header::USER_AGENT, "curl/8.5.0")
            .header("x-forwarded-for", "203.0.113.1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provider_verdicts_are_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = spawn_registry(hits).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = spawn_provider(calls.clone()).await;
        let gateway = spawn_gateway(
            Setup {
                upstream: registry.to_string(),
                provider: Some(provider),
                cache: false,
            },
            Arc::new(RecordingHealth::default()),
        )
        .await;

        for _ in 0..2 {
            let granted = docker_get(gateway, "/v2/", "203.0.113.10").await;
            assert_eq!(granted.status(), reqwest::StatusCode::OK);
            assert!(granted.headers().get("x-cache").is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            let denied = docker_get(gateway, "/v2/", "203.0.113.11").await;
            assert_eq!(denied.status(), reqwest::StatusCode::PAYMENT_REQUIRED);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let failing = docker_get(gateway, "/v2/", "203.0.113.12").await;
        assert_eq!(failing.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = failing.json().await.unwrap();
        assert!(body["errors"][0].get("detail").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_upstream_is_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = closed.local_addr().unwrap().to_string();
        drop(closed);

        let health = Arc::new(RecordingHealth::default());
        let gateway = spawn_gateway(
            Setup {
                upstream,
                provider: None,
                cache: true,
            },
            health.clone(),
        )
        .await;

        let response = docker_get(gateway, "/v2/app/tags/list", "198.51.100.40").await;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "BAD_GATEWAY");

        let reports = health.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("GET http://"), "{}", reports[0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panic_is_contained_to_one_request() {
        let (gateway, _, health) = standard_gateway().await;

        let exploded = docker_get(gateway, "/v2/app/manifests/explode", "198.51.100.50").await;
        assert_eq!(exploded.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(exploded.headers().contains_key("x-request-id"));

        let reports = health.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("manifest parser exploded"));

        let next = docker_get(gateway, "/v2/app/tags/list", "198.51.100.50").await;
        assert_eq!(next.status(), reqwest::StatusCode::OK);
        assert_eq!(health.reports().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_endpoint_and_guarded_metrics() {
        let (gateway, hits, _) = standard_gateway().await;

        let health = client()
            .get(format!("http://{gateway}/_health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(health.text().await.unwrap(), r#"{"status":"ok"}"#);

        let anonymous = client()
            .get(format!("http://{gateway}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(
            anonymous.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"metrics\""
        );

        let scraper = client()
            .get(format!("http://{gateway}/metrics"))
            .basic_auth("prom", Some("scrape"))
            .send()
            .await
            .unwrap();
        assert_eq!(scraper.status(), reqwest::StatusCode::OK);
        assert!(
            scraper.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
