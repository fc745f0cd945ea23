// Server configuration
//
// Loaded from environment variables (a `.env` file is read first by main).

use std::env;

use threadline_core::bus::DEFAULT_CAPACITY;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9090";

/// Configuration for the HTTP server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// History database DSN; history is disabled when unset
    pub threads_dsn: Option<String>,

    /// Address the server binds to
    pub listen_address: String,

    /// Prefix for all API routes (e.g. "/api")
    pub api_prefix: String,

    /// Origins allowed by CORS; empty means same-origin only
    pub cors_allowed_origins: Vec<String>,

    /// Event bus command queue and subscription buffer size
    pub event_bus_capacity: usize,

    /// Log persistence failures at debug instead of warn
    pub disable_server_error_logging: bool,
}

impl ServerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `THREADS_DSN`: sqlite://path, sqlite::memory: or postgres://... (optional)
    /// - `LISTEN_ADDRESS`: bind address (default: 127.0.0.1:9090)
    /// - `API_PREFIX`: route prefix (default: none)
    /// - `CORS_ALLOWED_ORIGINS`: comma separated origins (default: none)
    /// - `EVENT_BUS_CAPACITY`: bus buffer size (default: 64)
    /// - `DISABLE_SERVER_ERROR_LOGGING`: "true" or "1" to quiet persistence warnings
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let threads_dsn = lookup("THREADS_DSN").filter(|v| !v.is_empty());

        let listen_address = lookup("LISTEN_ADDRESS")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

        let api_prefix = lookup("API_PREFIX").unwrap_or_default();

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let event_bus_capacity = lookup("EVENT_BUS_CAPACITY")
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(DEFAULT_CAPACITY);

        let disable_server_error_logging = lookup("DISABLE_SERVER_ERROR_LOGGING")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        Self {
            threads_dsn,
            listen_address,
            api_prefix,
            cors_allowed_origins,
            event_bus_capacity,
            disable_server_error_logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);

        assert_eq!(config.threads_dsn, None);
        assert_eq!(config.listen_address, "127.0.0.1:9090");
        assert_eq!(config.api_prefix, "");
        assert!(config.cors_allowed_origins.is_empty());
        assert_eq!(config.event_bus_capacity, 64);
        assert!(!config.disable_server_error_logging);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("THREADS_DSN", "sqlite:///tmp/threads.db"),
            ("LISTEN_ADDRESS", "0.0.0.0:8080"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example.com, https://b.example.com,"),
            ("EVENT_BUS_CAPACITY", "0"),
            ("DISABLE_SERVER_ERROR_LOGGING", "TRUE"),
        ]);

        assert_eq!(config.threads_dsn.as_deref(), Some("sqlite:///tmp/threads.db"));
        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example.com", "https://b.example.com"]
        );
        assert_eq!(config.event_bus_capacity, 64);
        assert!(config.disable_server_error_logging);
    }
}
