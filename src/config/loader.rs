use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix of environment overrides, e.g. `REGATE__TARGET__HOST`.
pub const ENV_PREFIX: &str = "REGATE";
/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Keys that accept a comma separated list from the environment.
const LIST_KEYS: &[&str] = &[
    "auth.allowed.ips",
    "auth.allowed.uas",
    "auth.trusted.ips",
    "metrics.ips",
];

/// Environment source for `REGATE__*` variables.
pub fn environment() -> Environment {
    LIST_KEYS.iter().fold(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .list_separator(","),
        |env, key| env.with_list_parse_key(key),
    )
}

/// Load configuration from an optional file plus environment overrides.
/// Supports TOML, YAML and JSON files, picked by extension.
pub async fn load_config(config_path: Option<&str>) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: Option<&str>) -> Result<ServerConfig> {
    load_config_with_env(config_path, environment())
}

/// Load configuration with an explicit environment source.
pub fn load_config_with_env(config_path: Option<&str>, env: Environment) -> Result<ServerConfig> {
    let mut builder = Config::builder();

    if let Some(config_path) = config_path {
        let path = Path::new(config_path);
        builder = builder.add_source(File::new(config_path, file_format(path)));
    }

    let source = config_path.unwrap_or("environment");
    let settings = builder
        .add_source(env)
        .build()
        .with_context(|| format!("Failed to build config from {source}"))?;

    let server_config: ServerConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {source}"))?;

    Ok(server_config)
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use config::Map;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::core::error::ErrorFormat;

    fn env_from(vars: &[(&str, &str)]) -> Environment {
        let vars: Map<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        environment().source(Some(vars))
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:5000"
error_format = "plain"

[target]
scheme = "http"
host = "registry.internal:5000"

[cache]
ttl_secs = 60

[auth.allowed]
ips = ["10.1.2.3"]
uas = ["docker", "containerd"]

[auth.allowed.provider]
url = "https://psd.example.com/targets/{ip}"
login = "gate"
password = "secret"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config_with_env(temp_file.path().to_str(), env_from(&[])).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
        assert_eq!(config.error_format, ErrorFormat::Plain);
        assert_eq!(config.target.scheme, "http");
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.size, 1000);
        assert_eq!(config.auth.allowed.uas, vec!["docker", "containerd"]);
        let provider = config.auth.allowed.provider.unwrap();
        assert_eq!(provider.login.as_deref(), Some("gate"));
        assert_eq!(provider.timeout_secs, 10);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "target": { "host": "registry.internal" },
  "healthchecks": { "uuid": "5bf66975-d4c7-4bf5-bcc8-b8d8a82ea278" }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str()).await.unwrap();
        assert_eq!(config.target.host, "registry.internal");
        let healthchecks = config.healthchecks.unwrap();
        assert_eq!(healthchecks.url, "https://hc-ping.com");
        assert!(healthchecks.enabled_uuid().is_some());
    }

    #[test]
    fn environment_overrides_file() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "[target]\nhost = \"from-file\"\n").unwrap();

        let config = load_config_with_env(
            temp_file.path().to_str(),
            env_from(&[
                ("REGATE__TARGET__HOST", "from-env:5000"),
                ("REGATE__CACHE__ENABLED", "false"),
                ("REGATE__AUTH__ALLOWED__UAS", "docker,podman"),
                ("REGATE__METRICS__IPS", "127.0.0.1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.target.host, "from-env:5000");
        assert!(!config.cache.enabled);
        assert_eq!(config.auth.allowed.uas, vec!["docker", "podman"]);
        assert_eq!(config.metrics.ips, vec!["127.0.0.1"]);
    }

    #[test]
    fn environment_only() {
        let config =
            load_config_with_env(None, env_from(&[("REGATE__TARGET__HOST", "registry:5000")]))
                .unwrap();
        assert_eq!(config.target.host, "registry:5000");
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config_with_env(Some("/nonexistent/registry-gate.toml"), env_from(&[])).is_err());
    }
}
