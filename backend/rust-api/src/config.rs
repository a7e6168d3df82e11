use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_SEED_PATH: &str = "config/subjects.json";

/// Where the server keeps sessions, audit events and the subject bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Mongo,
}

impl StorageBackend {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => StorageBackend::Mongo,
            _ => StorageBackend::Memory,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub storage_backend: StorageBackend,
    /// JSON array of subjects loaded into the in-memory question bank
    pub seed_path: Option<String>,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub attempt: AttemptConfig,
}

/// Settings for a running attempt instance (the edge side).
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    /// Recoverable violations tolerated before the next one locks the attempt
    pub max_recoverable: u32,
    pub broadcast_key: String,
    /// Wall-clock length of one timer second; tests shorten it
    pub tick_interval_ms: u64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8081".to_string(),
            request_timeout_ms: 5000,
            max_recoverable: crate::attempt::violations::MAX_RECOVERABLE,
            broadcast_key: "proctor:attempt:active".to_string(),
            tick_interval_ms: 1000,
        }
    }
}

impl AttemptConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Config {
    /// Configuration for an in-memory server, used by tests and local runs without MongoDB.
    pub fn in_memory() -> Self {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_backend: StorageBackend::Memory,
            seed_path: None,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            mongo_database: "proctor".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            attempt: AttemptConfig::default(),
        }
    }

    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/{env}.toml + APP__ prefixed overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Config::in_memory();

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let storage_backend = settings
            .get_string("storage.backend")
            .or_else(|_| env::var("STORAGE_BACKEND"))
            .map(|value| StorageBackend::parse(&value))
            .unwrap_or(StorageBackend::Memory);

        let seed_path = settings
            .get_string("storage.seed_path")
            .or_else(|_| env::var("SEED_PATH"))
            .unwrap_or_else(|_| DEFAULT_SEED_PATH.to_string());

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or(defaults.mongo_uri);

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or(defaults.mongo_database);

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let attempt_defaults = defaults.attempt;
        let attempt = AttemptConfig {
            api_base_url: settings
                .get_string("attempt.api_base_url")
                .or_else(|_| env::var("PROCTOR_API_URL"))
                .unwrap_or(attempt_defaults.api_base_url),
            request_timeout_ms: read_u64(
                &settings,
                "attempt.request_timeout_ms",
                attempt_defaults.request_timeout_ms,
            ),
            max_recoverable: read_u64(
                &settings,
                "attempt.max_recoverable",
                attempt_defaults.max_recoverable as u64,
            ) as u32,
            broadcast_key: settings
                .get_string("attempt.broadcast_key")
                .unwrap_or(attempt_defaults.broadcast_key),
            tick_interval_ms: read_u64(
                &settings,
                "attempt.tick_interval_ms",
                attempt_defaults.tick_interval_ms,
            ),
        };

        if storage_backend == StorageBackend::Memory && env == "prod" {
            eprintln!("WARNING: in-memory session storage selected in prod; data is lost on restart");
        }

        Ok(Config {
            bind_addr,
            storage_backend,
            seed_path: Some(seed_path),
            mongo_uri,
            mongo_database,
            redis_uri,
            attempt,
        })
    }
}

fn read_u64(settings: &config::Config, key: &str, default: u64) -> u64 {
    settings
        .get_int(key)
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn storage_backend_parsing_falls_back_to_memory() {
        assert_eq!(StorageBackend::parse("Mongo"), StorageBackend::Mongo);
        assert_eq!(StorageBackend::parse("mongodb"), StorageBackend::Mongo);
        assert_eq!(StorageBackend::parse("sqlite"), StorageBackend::Memory);
    }

    #[test]
    #[serial]
    fn env_overrides_attempt_settings() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        std::env::set_var("APP__ATTEMPT__MAX_RECOVERABLE", "3");
        std::env::set_var("APP__ATTEMPT__TICK_INTERVAL_MS", "250");

        let config = Config::load().unwrap();
        assert_eq!(config.attempt.max_recoverable, 3);
        assert_eq!(config.attempt.tick_interval(), Duration::from_millis(250));

        std::env::remove_var("APP__ATTEMPT__MAX_RECOVERABLE");
        std::env::remove_var("APP__ATTEMPT__TICK_INTERVAL_MS");
        std::env::remove_var("SKIP_ROOT_ENV");
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        let config = Config::load().unwrap();
        assert_eq!(config.attempt.max_recoverable, 1);
        assert_eq!(config.attempt.broadcast_key, "proctor:attempt:active");
        assert_eq!(config.seed_path.as_deref(), Some("config/subjects.json"));
        std::env::remove_var("SKIP_ROOT_ENV");
    }
}
