use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use registry_gate::{
    adapters::{
        AppState, HealthchecksClient, HttpAuthProvider, HttpClientAdapter, auth_provider::UrlTemplate,
        build_router, middleware::MetricsAccess,
    },
    config::{ServerConfig, ServerConfigValidator, load_config, parse_ip_list},
    core::{AuthDecisionCache, AuthEngine, Gateway, ResponseCache, StaticAllowList, UpstreamTarget},
    metrics::{self, DEFAULT_EVENT_QUEUE, EventEmitter},
    ports::{HealthReporter, HttpClient, NoopHealthReporter},
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file; `REGATE__*` environment variables override it
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "registry-gate.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => {
            return validate_config_command(config.or(args.config).as_deref()).await;
        }
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Serve { config }) => config.or(args.config),
        None => args.config,
    };

    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;
    tracing_setup::init_tracing_with_config(&config.log.level, config.log.json)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    ServerConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    serve(config).await
}

async fn serve(config: ServerConfig) -> Result<()> {
    let prometheus = metrics::init_metrics()?;
    let (events, _recorder) = EventEmitter::spawn(DEFAULT_EVENT_QUEUE);

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move { signal_handler_shutdown.run_signal_handler().await });

    let healthchecks = match config.healthchecks.as_ref() {
        Some(hc) => match hc.enabled_uuid() {
            Some(uuid) => {
                let client = HealthchecksClient::new(&hc.url, uuid)
                    .context("Failed to create healthchecks client")?;
                if let Err(e) = client.start("registry-gate starting").await {
                    tracing::warn!(error = %e, "healthchecks start ping failed");
                }
                let pinger = client.clone();
                let interval = hc.interval();
                let shutdown_rx = graceful_shutdown.subscribe();
                tokio::spawn(async move { pinger.run(interval, shutdown_rx).await });
                Some(client)
            }
            None => None,
        },
        None => None,
    };
    let health: Arc<dyn HealthReporter> = match &healthchecks {
        Some(client) => Arc::new(client.clone()),
        None => Arc::new(NoopHealthReporter),
    };

    let auth = Arc::new(build_auth_engine(&config, events.clone())?);

    let cache = config.cache.enabled.then(|| {
        ResponseCache::new(
            config.cache.ttl(),
            config.cache.size,
            config.cache.max_entry_bytes,
        )
    });

    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(config.target.connect_timeout(), config.target.timeout())
            .context("Failed to create HTTP client adapter")?,
    );
    let target = UpstreamTarget::new(&config.target.scheme, config.target.host.trim())
        .context("Invalid upstream target")?;
    let gateway = Arc::new(Gateway::new(
        http_client,
        target,
        health.clone(),
        events.clone(),
        config.error_format,
    ));

    let metrics_access = Arc::new(MetricsAccess::new(
        config.metrics.login.clone(),
        config.metrics.password.clone(),
        parse_ip_list("metrics.ips", &config.metrics.ips)?,
    ));
    if !metrics_access.is_enabled() {
        tracing::info!("/metrics disabled: neither metrics.login nor metrics.ips is set");
    }

    let state = AppState {
        auth,
        cache,
        gateway,
        health,
        events,
        metrics_access,
        prometheus: Some(prometheus),
    };
    let app = build_router(state);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        listen_addr = %addr,
        upstream = %format!("{}://{}", config.target.scheme, config.target.host),
        cache = config.cache.enabled,
        provider = config.auth.allowed.provider.is_some(),
        "registry-gate listening"
    );

    let reason = tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("Server error")?;
            None
        },
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!(?reason, "shutdown signal received");
            Some(reason)
        }
    };

    if let (Some(client), Some(reason)) = (healthchecks, reason) {
        if let Err(e) = client
            .exit_status(reason.exit_code(), "registry-gate stopping")
            .await
        {
            tracing::warn!(error = %e, "healthchecks exit ping failed");
        }
    }

    tracing::info!("registry-gate stopped");
    Ok(())
}

fn build_auth_engine(config: &ServerConfig, events: EventEmitter) -> Result<AuthEngine> {
    let auth = &config.auth;
    let allow_list = StaticAllowList::new(
        parse_ip_list("auth.allowed.ips", &auth.allowed.ips)?,
        parse_ip_list("auth.trusted.ips", &auth.trusted.ips)?,
        &auth.allowed.uas,
    );
    let verdicts = AuthDecisionCache::new(auth.ttl(), auth.positive_size, auth.negative_size);
    let engine = AuthEngine::new(allow_list, verdicts, events);

    let Some(provider) = &auth.allowed.provider else {
        return Ok(engine);
    };
    let template = UrlTemplate::parse(&provider.url).context("Invalid provider URL")?;
    tracing::info!(url = template.as_str(), "authorization provider enabled");
    let client = HttpAuthProvider::new(
        template,
        provider.login.clone(),
        provider.password.clone(),
        provider.timeout(),
    )
    .map_err(|e| eyre!("Failed to create provider client: {e}"))?;

    Ok(engine.with_provider(Arc::new(client), provider.timeout()))
}

/// Validate configuration and print a summary
async fn validate_config_command(config_path: Option<&str>) -> Result<()> {
    let source = config_path.unwrap_or("environment");
    println!("Validating configuration: {source}");

    if let Some(path) = config_path {
        if !Path::new(path).exists() {
            eprintln!("Error: configuration file '{path}' not found");
            std::process::exit(1);
        }
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration summary:");
            println!("   Listen address: {}", config.listen_addr);
            println!(
                "   Upstream: {}://{}",
                config.target.scheme, config.target.host
            );
            println!(
                "   Response cache: {}",
                if config.cache.enabled {
                    format!("{} entries, {}s TTL", config.cache.size, config.cache.ttl_secs)
                } else {
                    "disabled".to_string()
                }
            );
            println!(
                "   Allowed IPs: {}, trusted IPs: {}, user agents: {}",
                config.auth.allowed.ips.len(),
                config.auth.trusted.ips.len(),
                config.auth.allowed.uas.join(", ")
            );
            println!(
                "   Provider: {}",
                config
                    .auth
                    .allowed
                    .provider
                    .as_ref()
                    .map_or("none", |provider| provider.url.as_str())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# registry-gate configuration
# Every key can be overridden from the environment, e.g. REGATE__TARGET__HOST.

listen_addr = "0.0.0.0:8080"
# "json" registry error envelopes, or "plain" status-only responses
error_format = "json"

[log]
level = "info"
json = true

[target]
scheme = "https"
host = "registry.internal:5000"
connect_timeout_secs = 10
timeout_secs = 300

[cache]
enabled = true
ttl_secs = 3600
size = 1000
max_entry_bytes = 4194304

[auth]
ttl_secs = 3600
positive_size = 1000
negative_size = 10000

[auth.allowed]
# Clients that may read without further checks
ips = []
# Accepted user agent product names
uas = ["docker", "containerd", "podman", "skopeo"]

# Entitlement check for everyone else; {ip} is replaced by the client address
# [auth.allowed.provider]
# url = "https://entitlements.example.com/targets/{ip}"
# login = "registry-gate"
# password = "change-me"
# timeout_secs = 10

[auth.trusted]
# Clients allowed to push and delete
ips = []

[metrics]
# login = "prometheus"
# password = "change-me"
ips = ["127.0.0.1"]

# [healthchecks]
# url = "https://hc-ping.com"
# uuid = "00000000-0000-0000-0000-000000000000"
# interval_secs = 60
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'registry-gate serve --config {config_path}' to start the gateway");
    Ok(())
}
