use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub trust: TrustConfig,
    pub negotiation: NegotiationConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub idempotency: IdempotencyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Identifier stamped on every response envelope.
    pub node_id: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct TrustConfig {
    /// Minimum reputation required for execute intents.
    pub min_execute_reputation: f64,
    /// Default per-agent request budget for new registrations.
    pub default_requests_per_minute: u32,
    /// Bearer token for the privileged admin endpoints.
    pub admin_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct NegotiationConfig {
    pub max_rounds: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct UpstreamConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a half-open trial.
    pub cooldown_secs: u64,
    /// Retry attempts for rate-limited PMS responses.
    pub rate_limit_retries: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct IdempotencyConfig {
    pub retention_days: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            node_id: "acp-gw-1".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://acp-gateway.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            min_execute_reputation: 0.3,
            default_requests_per_minute: 60,
            admin_token: None,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { max_rounds: 5 }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            rate_limit_retries: 3,
            request_timeout_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 120 }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {e}")))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config file: {e}")))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(url) = std::env::var("ACP_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(token) = std::env::var("ACP_ADMIN_TOKEN") {
            config.trust.admin_token = Some(token);
        }
        if let Ok(node_id) = std::env::var("ACP_NODE_ID") {
            config.server.node_id = node_id;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config("Server port cannot be 0".into()));
        }
        if self.database.url.is_empty() {
            return Err(GatewayError::Config("Database URL cannot be empty".into()));
        }
        if self.negotiation.max_rounds == 0 {
            return Err(GatewayError::Config(
                "negotiation.max_rounds must be at least 1".into(),
            ));
        }
        if self.upstream.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "upstream.failure_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.trust.min_execute_reputation) {
            return Err(GatewayError::Config(
                "trust.min_execute_reputation must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| GatewayError::Config(format!("Failed to serialize default config: {e}")))?;

    std::fs::write(path, toml_str)
        .map_err(|e| GatewayError::Config(format!("Failed to write default config file: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.negotiation.max_rounds, 5);
        assert_eq!(config.upstream.failure_threshold, 3);
        assert_eq!(config.upstream.cooldown_secs, 60);
        assert_eq!(config.cache.ttl_secs, 120);
        assert_eq!(config.idempotency.retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.trust.min_execute_reputation = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        let loaded = AppConfig::load(path).unwrap();
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.cache.ttl_secs, 120);
    }

    #[test]
    fn test_partial_config_uses_section_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"
[server]
host = "0.0.0.0"
port = 9000
node_id = "gw-test"
"#,
        )
        .unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.negotiation.max_rounds, 5);
    }
}
