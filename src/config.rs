//! Typed configuration assembled from the environment (ambient stack).
//!
//! The teacher reads `dotenvy::var` calls inline in `main`; this generalizes
//! that into one struct covering the configuration surface enumerated in
//! spec.md §6, still sourced through `dotenvy`/`std::env` the way the
//! teacher already depends on.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub is_prod: bool,
    pub tls_key_path: Option<String>,
    pub tls_cert_path: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CorsConfig {
    pub origin: Option<String>,
    pub credentials: bool,
    pub strict_mode: bool,
    pub development_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub disable_synth_rate_limit: bool,
    pub disable_voice_rate_limit: bool,
}

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_connections_per_room: usize,
    pub max_connections_global: usize,
    pub queue_size: usize,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub compression_enabled: bool,
    pub batching_enabled: bool,
    pub ip_connections_per_minute: u32,
}

#[derive(Clone, Debug)]
pub struct CleanupConfig {
    pub cleanup_interval: Duration,
    pub aggressive_cleanup_interval: Duration,
    pub inactive_threshold: Duration,
    pub empty_threshold: Duration,
    pub memory_pressure_threshold_mb: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level_filter: String,
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub admission: AdmissionConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Builds configuration from environment variables, falling back to the
    /// defaults spelled out across spec.md §4 and §6.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            server: ServerConfig {
                host: env_var("HOST")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                port: env_parse("PORT", 3100),
                is_prod: env_var("IS_PROD").is_some_and(|s| s == "true"),
                tls_key_path: env_var("TLS_PRIVATE_KEY"),
                tls_cert_path: env_var("TLS_CERT_KEY"),
            },
            cors: CorsConfig {
                origin: env_var("CORS_ORIGIN"),
                credentials: env_var("CORS_CREDENTIALS").is_some_and(|s| s == "true"),
                strict_mode: env_var("CORS_STRICT_MODE").is_some_and(|s| s == "true"),
                development_origins: env_var("CORS_DEV_ORIGINS")
                    .map(|s| s.split(',').map(str::to_owned).collect())
                    .unwrap_or_default(),
            },
            rate_limit: RateLimitConfig {
                disable_synth_rate_limit: env_var("DISABLE_SYNTH_RATE_LIMIT")
                    .is_some_and(|s| s == "true"),
                disable_voice_rate_limit: env_var("DISABLE_VOICE_RATE_LIMIT")
                    .is_some_and(|s| s == "true"),
            },
            admission: AdmissionConfig {
                max_connections_per_room: env_parse("MAX_CONNECTIONS_PER_ROOM", 50),
                max_connections_global: env_parse("MAX_CONNECTIONS_GLOBAL", 1000),
                queue_size: env_parse("QUEUE_SIZE", 100),
                connection_timeout: Duration::from_secs(env_parse("CONNECTION_TIMEOUT_SECS", 30)),
                heartbeat_interval: Duration::from_secs(env_parse("HEARTBEAT_INTERVAL_SECS", 25)),
                batch_size: env_parse("BATCH_SIZE", 10),
                batch_delay: Duration::from_millis(env_parse("BATCH_DELAY_MS", 100)),
                compression_enabled: !env_var("DISABLE_COMPRESSION").is_some_and(|s| s == "true"),
                batching_enabled: !env_var("DISABLE_BATCHING").is_some_and(|s| s == "true"),
                ip_connections_per_minute: env_parse("IP_CONNECTIONS_PER_MINUTE", 10),
            },
            cleanup: CleanupConfig {
                cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECS", 300)),
                aggressive_cleanup_interval: Duration::from_secs(env_parse(
                    "AGGRESSIVE_CLEANUP_INTERVAL_SECS",
                    1800,
                )),
                inactive_threshold: Duration::from_secs(env_parse(
                    "INACTIVE_THRESHOLD_SECS",
                    1800,
                )),
                empty_threshold: Duration::from_secs(env_parse("EMPTY_THRESHOLD_SECS", 300)),
                memory_pressure_threshold_mb: env_parse("MEMORY_PRESSURE_THRESHOLD_MB", 600),
            },
            logging: LoggingConfig {
                level_filter: env_var("LOG").unwrap_or_else(|| "info".to_owned()),
                log_dir: env_var("LOG_DIR").unwrap_or_else(|| "./logs".to_owned()),
            },
        }
    }
}

#[cfg(test)]
impl Config {
    /// Builds a config from spec.md's defaults directly, without touching
    /// the environment — used by integration-style scenario tests so they
    /// don't race `from_env`'s env-var reads against each other.
    pub fn test_defaults() -> Self {
        Config {
            server: ServerConfig {
                host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 3100,
                is_prod: false,
                tls_key_path: None,
                tls_cert_path: None,
            },
            cors: CorsConfig {
                origin: None,
                credentials: false,
                strict_mode: false,
                development_origins: Vec::new(),
            },
            rate_limit: RateLimitConfig {
                disable_synth_rate_limit: false,
                disable_voice_rate_limit: false,
            },
            admission: AdmissionConfig {
                max_connections_per_room: 50,
                max_connections_global: 1000,
                queue_size: 100,
                connection_timeout: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(25),
                batch_size: 10,
                batch_delay: Duration::from_millis(100),
                compression_enabled: true,
                batching_enabled: true,
                ip_connections_per_minute: 10,
            },
            cleanup: CleanupConfig {
                cleanup_interval: Duration::from_secs(300),
                aggressive_cleanup_interval: Duration::from_secs(1800),
                inactive_threshold: Duration::from_secs(1800),
                empty_threshold: Duration::from_secs(300),
                memory_pressure_threshold_mb: 600,
            },
            logging: LoggingConfig {
                level_filter: "info".to_owned(),
                log_dir: "./logs".to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        // SAFETY: single-threaded test process, no concurrent env mutation.
        unsafe {
            for key in [
                "MAX_CONNECTIONS_PER_ROOM",
                "MAX_CONNECTIONS_GLOBAL",
                "QUEUE_SIZE",
                "HOST",
                "PORT",
            ] {
                std::env::remove_var(key);
            }
        }

        let cfg = Config::from_env();
        assert_eq!(cfg.admission.max_connections_per_room, 50);
        assert_eq!(cfg.admission.max_connections_global, 1000);
        assert_eq!(cfg.admission.queue_size, 100);
        assert_eq!(cfg.admission.connection_timeout, Duration::from_secs(30));
        assert_eq!(cfg.server.port, 3100);
    }
}
