use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::ports::auth_provider::{AuthProvider, ProviderError, ProviderGrant};

/// User agent sent to the provider.
pub const PROVIDER_USER_AGENT: &str = concat!("registry-gate/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlTemplateError {
    #[error("template produces an invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
}

/// Provider URL with a client IP placeholder, `{ip}` or `%s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    /// Parse and check that substituting an address yields a usable URL.
    pub fn parse(template: &str) -> Result<Self, UrlTemplateError> {
        let template = Self(template.trim().to_string());
        template.render(IpAddr::from([192, 0, 2, 1]))?;
        Ok(template)
    }

    pub fn render(&self, ip: IpAddr) -> Result<Url, UrlTemplateError> {
        let ip = ip.to_string();
        let raw = self.0.replace("{ip}", &ip).replace("%s", &ip);
        let url = Url::parse(&raw).map_err(|err| UrlTemplateError::InvalidUrl(err.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(UrlTemplateError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tenant entry as returned by the provider.
#[derive(Debug, Deserialize)]
struct Target {
    #[serde(alias = "domain")]
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GrantBody {
    Targets(Vec<Target>),
    Single(Target),
}

/// Interpret a `200 OK` body.
///
/// An empty body, or one that is not JSON, grants access without a host.
/// An empty target list means the client has nothing left to pull from.
pub fn parse_grant(body: &[u8]) -> Result<ProviderGrant, ProviderError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ProviderGrant::default());
    }
    match serde_json::from_slice::<GrantBody>(body) {
        Ok(GrantBody::Targets(targets)) if targets.is_empty() => {
            Err(ProviderError::NotEntitled("no targets".to_string()))
        }
        Ok(GrantBody::Targets(targets)) => Ok(ProviderGrant {
            resolved_host: targets.into_iter().find_map(|target| target.host),
        }),
        Ok(GrantBody::Single(target)) => Ok(ProviderGrant {
            resolved_host: target.host,
        }),
        Err(err) => {
            tracing::debug!(error = %err, "provider body is not a target list, granting without host");
            Ok(ProviderGrant::default())
        }
    }
}

/// HTTP entitlement check against an external service.
pub struct HttpAuthProvider {
    client: Client,
    template: UrlTemplate,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl HttpAuthProvider {
    pub fn new(
        template: UrlTemplate,
        login: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(PROVIDER_USER_AGENT)
            .build()
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        let credentials = match (login, password) {
            (Some(login), Some(password)) if !login.is_empty() && !password.is_empty() => {
                Some((login, password))
            }
            _ => None,
        };

        Ok(Self {
            client,
            template,
            credentials,
            timeout,
        })
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn check(&self, ip: IpAddr) -> Result<ProviderGrant, ProviderError> {
        let url = self
            .template
            .render(ip)
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json");
        if let Some((login, password)) = &self.credentials {
            request = request.basic_auth(login, Some(password));
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::Unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
                parse_grant(&body)
            }
            StatusCode::PAYMENT_REQUIRED | StatusCode::GONE => {
                Err(ProviderError::NotEntitled(status.to_string()))
            }
            _ => Err(ProviderError::Unavailable(format!(
                "unexpected provider status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        extract::Path,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
    };
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn template_placeholders() {
        let ip: IpAddr = "198.51.100.4".parse().unwrap();

        let braces = UrlTemplate::parse("https://psd.example.com/targets/{ip}").unwrap();
        assert_eq!(
            braces.render(ip).unwrap().as_str(),
            "https://psd.example.com/targets/198.51.100.4"
        );

        let printf = UrlTemplate::parse("http://psd.example.com/check?ip=%s").unwrap();
        assert_eq!(
            printf.render(ip).unwrap().as_str(),
            "http://psd.example.com/check?ip=198.51.100.4"
        );
    }

    #[test]
    fn template_validation() {
        assert!(matches!(
            UrlTemplate::parse("ftp://psd.example.com/{ip}"),
            Err(UrlTemplateError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            UrlTemplate::parse("not a url {ip}"),
            Err(UrlTemplateError::InvalidUrl(_))
        ));
    }

    #[test]
    fn grant_bodies() {
        assert_eq!(parse_grant(b"").unwrap(), ProviderGrant::default());
        assert_eq!(parse_grant(b"OK").unwrap(), ProviderGrant::default());
        assert_eq!(
            parse_grant(br#"[{"domain":"tenant-a.example"},{"domain":"tenant-b.example"}]"#)
                .unwrap()
                .resolved_host
                .as_deref(),
            Some("tenant-a.example")
        );
        assert_eq!(
            parse_grant(br#"{"host":"tenant-c.example"}"#)
                .unwrap()
                .resolved_host
                .as_deref(),
            Some("tenant-c.example")
        );
        assert!(matches!(parse_grant(b"[]"), Err(ProviderError::NotEntitled(_))));
    }

    async fn provider_server() -> (String, Arc<Mutex<Vec<HeaderMap>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let app = Router::new().route(
            "/targets/{ip}",
            get(move |Path(ip): Path<String>, headers: HeaderMap| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(headers);
                    match ip.as_str() {
                        "198.51.100.1" => (AxumStatus::OK, r#"[{"host":"tenant.example"}]"#),
                        "198.51.100.2" => (AxumStatus::GONE, ""),
                        "198.51.100.3" => (AxumStatus::PAYMENT_REQUIRED, ""),
                        _ => (AxumStatus::SERVICE_UNAVAILABLE, "maintenance"),
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}/targets/{{ip}}"), seen)
    }

    #[tokio::test]
    async fn provider_status_mapping() {
        let (template, seen) = provider_server().await;
        let provider = HttpAuthProvider::new(
            UrlTemplate::parse(&template).unwrap(),
            Some("gate".into()),
            Some("s3cret".into()),
            Duration::from_secs(5),
        )
        .unwrap();

        let grant = provider.check("198.51.100.1".parse().unwrap()).await.unwrap();
        assert_eq!(grant.resolved_host.as_deref(), Some("tenant.example"));

        for ip in ["198.51.100.2", "198.51.100.3"] {
            let err = provider.check(ip.parse().unwrap()).await.unwrap_err();
            assert!(matches!(err, ProviderError::NotEntitled(_)), "{ip}: {err}");
        }

        let err = provider
            .check("198.51.100.9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));

        let seen = seen.lock().unwrap();
        let first = &seen[0];
        assert!(
            first[header::USER_AGENT]
                .to_str()
                .unwrap()
                .starts_with("registry-gate/")
        );
        assert!(
            first[header::AUTHORIZATION]
                .to_str()
                .unwrap()
                .starts_with("Basic ")
        );
    }

    #[tokio::test]
    async fn unreachable_provider_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = HttpAuthProvider::new(
            UrlTemplate::parse(&format!("http://{addr}/targets/%s")).unwrap(),
            None,
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let err = provider
            .check("198.51.100.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
