//! Environment-driven configuration. Read once at startup, immutable after.

use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub database_url: String,
    /// Delivery bus. `None` keeps delivery in-process (single instance).
    pub redis_uri: Option<String>,

    pub jwt_secret: String,
    pub jwt_expires_secs: i64,

    /// Conversations per listing page.
    pub per_page: i64,
    /// Messages per history page.
    pub history_page: i64,
    /// Conversations a single user may pin.
    pub max_pins: i64,

    pub socket_idle_secs: u64,

    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn parse_i64(key: &str, default: i64) -> Result<i64, String> {
    env_or(key, &default.to_string())
        .parse()
        .map_err(|_| format!("{key} must be an integer"))
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let host = env_or("APP_HOST", "127.0.0.1");
        let port: u16 = env_or("APP_PORT", "8080")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let database_url = env_or("DATABASE_URL", "sqlite:sotto.db");

        let redis_uri = env_opt("REDIS_URI").or_else(|| {
            env_opt("REDIS_HOST")
                .map(|h| format!("redis://{h}:{}", env_or("REDIS_PORT", "6379")))
        });

        let jwt_secret = env_opt("JWT_SECRET").ok_or("JWT_SECRET must be set")?;
        let jwt_expires_secs = parse_i64("JWT_EXPIRES_IN", 86_400)?;

        let per_page = parse_i64("CHAT_PER_PAGE", 10)?.max(1);
        let history_page = parse_i64("CHAT_HISTORY", 20)?.max(1);
        let max_pins = parse_i64("CHAT_MAX_PINS", 5)?.max(1);

        let socket_idle_secs = parse_i64("SOCKET_IDLE_SECS", 960)?.max(1) as u64;

        Ok(Self {
            host,
            port,
            database_url,
            redis_uri,
            jwt_secret,
            jwt_expires_secs,
            per_page,
            history_page,
            max_pins,
            socket_idle_secs,
            tls_cert: env_opt("TLS_CERT"),
            tls_key: env_opt("TLS_KEY"),
        })
    }

    /// In-memory configuration for tests: no Redis, throwaway database.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            redis_uri: None,
            jwt_secret: "test-secret".into(),
            jwt_expires_secs: 3600,
            per_page: 10,
            history_page: 20,
            max_pins: 5,
            socket_idle_secs: 960,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = Vec::with_capacity(keys.len());
            for k in keys {
                saved.push((k.to_string(), env::var(k).ok()));
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    const KEYS: &[&str] = &[
        "APP_HOST",
        "APP_PORT",
        "DATABASE_URL",
        "REDIS_URI",
        "REDIS_HOST",
        "REDIS_PORT",
        "JWT_SECRET",
        "JWT_EXPIRES_IN",
        "CHAT_PER_PAGE",
        "CHAT_HISTORY",
        "CHAT_MAX_PINS",
        "SOCKET_IDLE_SECS",
        "TLS_CERT",
        "TLS_KEY",
    ];

    #[test]
    fn requires_jwt_secret() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(KEYS);

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("JWT_SECRET"));
    }

    #[test]
    fn applies_documented_defaults() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(KEYS);
        env::set_var("JWT_SECRET", "s3cret");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.per_page, 10);
        assert_eq!(cfg.history_page, 20);
        assert_eq!(cfg.max_pins, 5);
        assert_eq!(cfg.socket_idle_secs, 960);
        assert!(cfg.redis_uri.is_none());
    }

    #[test]
    fn composes_redis_uri_from_host_and_port() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(KEYS);
        env::set_var("JWT_SECRET", "s3cret");
        env::set_var("REDIS_HOST", "cache.internal");
        env::set_var("REDIS_PORT", "6380");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.redis_uri.as_deref(), Some("redis://cache.internal:6380"));

        env::set_var("REDIS_URI", "redis://explicit:6379/2");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.redis_uri.as_deref(), Some("redis://explicit:6379/2"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(KEYS);
        env::set_var("JWT_SECRET", "s3cret");
        env::set_var("CHAT_MAX_PINS", "five");

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("CHAT_MAX_PINS"));
    }
}
