//! Application configuration

use std::env;

/// Webhook server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
    pub max_body_bytes: usize,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            trust_proxy_headers: parse_bool("TRUST_PROXY_HEADERS", false)?,
            max_body_bytes: env::var("MAX_BODY_BYTES")
                .unwrap_or_else(|_| "65536".to_string())
                .parse()
                .unwrap_or(65536),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            run_migrations: parse_bool("RUN_MIGRATIONS", true)?,
        })
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(key, raw)),
        },
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests modify shared env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn clear() {
        for key in [
            "BIND_ADDRESS",
            "TRUST_PROXY_HEADERS",
            "DATABASE_URL",
            "DATABASE_MAX_CONNECTIONS",
            "RUN_MIGRATIONS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("DATABASE_URL", "postgres://test");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(!config.trust_proxy_headers);
        assert!(config.run_migrations);
        assert_eq!(config.database_max_connections, 10);
    }

    #[test]
    fn test_missing_database_url() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_trust_proxy_headers_flag() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("TRUST_PROXY_HEADERS", "true");
        assert!(Config::from_env().unwrap().trust_proxy_headers);

        env::set_var("TRUST_PROXY_HEADERS", "maybe");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("TRUST_PROXY_HEADERS", _)
        ));
        clear();
    }
}
