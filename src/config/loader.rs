use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::GatewayConfig, validation::GatewayConfigValidator};

/// Prefix for environment overrides, e.g. `CONDUIT__POOL__MAX_TOTAL_CONNECTIONS=50`
const ENV_PREFIX: &str = "CONDUIT";

/// Load and validate configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let config = load_config_sync(config_path)?;
    GatewayConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration synchronously, without validation
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

/// Load configuration without validation (used for the validate command)
pub async fn load_config_unchecked(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
pool:
  max_connections_per_destination: 4
  max_total_connections: 16
retry:
  max_attempts: 5
  initial_delay_ms: 250
providers:
  openai:
    destination: "https://api.openai.com"
    path: "/v1/chat/completions"
    model_prefixes: ["gpt-", "o1"]
    capabilities: ["chat"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.pool.max_connections_per_destination, 4);
        assert_eq!(config.pool.max_total_connections, 16);
        // untouched fields keep defaults
        assert_eq!(config.pool.keep_alive_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
            config.providers["openai"].model_prefixes,
            vec!["gpt-".to_string(), "o1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "circuit_breaker": {
    "failure_threshold": 2,
    "recovery_timeout_ms": 5000
  },
  "providers": {
    "local": {
      "destination": "http://127.0.0.1:11434",
      "capabilities": ["chat", "embeddings"]
    }
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout_ms, 5_000);
        assert_eq!(config.providers["local"].path, "/");
        assert!(config.providers["local"].enabled);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let yaml_content = r#"
pool:
  max_connections_per_destination: 50
  max_total_connections: 10
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let path = temp_file.path().to_str().unwrap();
        assert!(load_config(path).await.is_err());
        // the unchecked variant still parses it
        assert!(load_config_unchecked(path).await.is_ok());
    }
}
