use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::session_service::SessionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = config::ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" | "in-memory" => Ok(StoreBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "unknown store backend {:?} (expected mongo or memory)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub store_backend: StoreBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub session_duration_seconds: u32,
    pub grace_delay_ms: u64,
    pub autosave_interval_seconds: u64,
    pub max_write_attempts: usize,
    pub sse_tick_interval_ms: u64,
    pub worker_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            store_backend: StoreBackend::Mongo,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            mongo_database: "examroom".to_string(),
            session_duration_seconds: 420,
            grace_delay_ms: 3000,
            autosave_interval_seconds: 3,
            max_write_attempts: 5,
            sse_tick_interval_ms: 1000,
            worker_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Config::default();

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or(defaults.bind_addr);

        let store_backend = match settings
            .get_string("store.backend")
            .or_else(|_| env::var("STORE_BACKEND"))
        {
            Ok(value) => value.parse()?,
            Err(_) => defaults.store_backend,
        };

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or(defaults.mongo_uri);

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or(defaults.mongo_database);

        Ok(Config {
            bind_addr,
            store_backend,
            mongo_uri,
            mongo_database,
            session_duration_seconds: number(
                &settings,
                "session.duration_seconds",
                "SESSION_DURATION_SECONDS",
                defaults.session_duration_seconds,
            )?,
            grace_delay_ms: number(
                &settings,
                "session.grace_delay_ms",
                "SESSION_GRACE_DELAY_MS",
                defaults.grace_delay_ms,
            )?,
            autosave_interval_seconds: number(
                &settings,
                "session.autosave_interval_seconds",
                "AUTOSAVE_INTERVAL_SECONDS",
                defaults.autosave_interval_seconds,
            )?,
            max_write_attempts: number(
                &settings,
                "session.max_write_attempts",
                "SESSION_MAX_WRITE_ATTEMPTS",
                defaults.max_write_attempts,
            )?,
            sse_tick_interval_ms: number(
                &settings,
                "stream.tick_interval_ms",
                "SSE_TICK_INTERVAL_MS",
                defaults.sse_tick_interval_ms,
            )?,
            worker_interval_ms: number(
                &settings,
                "worker.interval_ms",
                "EXPIRY_WORKER_INTERVAL_MS",
                defaults.worker_interval_ms,
            )?,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            duration_seconds: self.session_duration_seconds,
            grace_delay: Duration::from_millis(self.grace_delay_ms),
            autosave_interval: Duration::from_secs(self.autosave_interval_seconds),
            max_write_attempts: self.max_write_attempts.max(1),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.sse_tick_interval_ms.max(1))
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms.max(1))
    }
}

/// Positive number from the config tree, else the plain env var, else the
/// default.
fn number<T>(
    settings: &config::Config,
    key: &str,
    env_key: &str,
    default: T,
) -> Result<T, config::ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let raw = settings
        .get_string(key)
        .ok()
        .or_else(|| env::var(env_key).ok());
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(config::ConfigError::Message(format!(
            "{} must be a positive number, got {:?}",
            key, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "BIND_ADDR",
            "STORE_BACKEND",
            "SESSION_DURATION_SECONDS",
            "SESSION_GRACE_DELAY_MS",
            "APP__SESSION__DURATION_SECONDS",
        ] {
            env::remove_var(key);
        }
        env::set_var("SKIP_ROOT_ENV", "1");
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        clear_env();
        let config = Config::load().unwrap();
        assert_eq!(config.session_duration_seconds, 420);
        assert_eq!(config.grace_delay_ms, 3000);
        assert_eq!(config.store_backend, StoreBackend::Mongo);
    }

    #[test]
    #[serial]
    fn env_fallbacks_override_defaults() {
        clear_env();
        env::set_var("STORE_BACKEND", "memory");
        env::set_var("SESSION_DURATION_SECONDS", "600");
        let config = Config::load().unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.session_settings().duration_seconds, 600);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_numbers_are_rejected() {
        clear_env();
        env::set_var("SESSION_GRACE_DELAY_MS", "-5");
        assert!(Config::load().is_err());
        clear_env();
    }
}
