use std::env;
use std::time::Duration;

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub enable_tls: bool,
    pub log_level: String,
    pub jwt_secret: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_expiry_days: i64,
    pub argon2_salt_length: u32,
    pub max_message_length: usize,
    pub persist_timeout_ms: u64, // Upper bound on one message store before the sender gets an error
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            println!("[AUTH] No JWT_SECRET in .env, falling back to the development default (set JWT_SECRET in production)");
            "your_jwt_secret".to_string()
        });

        Self {
            host: env_str("SERVER_HOST", "127.0.0.1"),
            port: env_parse("SERVER_PORT", 5000),
            database_url: env_str("DATABASE_URL", "sqlite:data/chattify.db"),
            enable_tls: matches!(env::var("ENABLE_TLS").as_deref(), Ok("true") | Ok("1")),
            log_level: env_str("LOG_LEVEL", "info"),
            jwt_secret,
            jwt_expiry_minutes: env_parse("JWT_EXPIRY_MINUTES", 60),
            refresh_expiry_days: env_parse("REFRESH_EXPIRY_DAYS", 7),
            argon2_salt_length: env_parse("ARGON2_SALT_LENGTH", 16),
            max_message_length: env_parse("MAX_MESSAGE_LENGTH", 2048),
            persist_timeout_ms: env_parse("PERSIST_TIMEOUT_MS", 5000),
        }
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_host: String,
    pub default_port: u16,
    pub websocket_host: String,
    pub websocket_port: u16,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            default_host: env_str("CLIENT_DEFAULT_HOST", "127.0.0.1"),
            default_port: env_parse("CLIENT_DEFAULT_PORT", 5000),
            websocket_host: env_str("WEBSOCKET_HOST", "127.0.0.1"),
            websocket_port: env_parse("WEBSOCKET_PORT", 5001),
        }
    }
}

#[cfg(test)]
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        enable_tls: false,
        log_level: "info".to_string(),
        jwt_secret: "test-secret".to_string(),
        jwt_expiry_minutes: 60,
        refresh_expiry_days: 7,
        argon2_salt_length: 16,
        max_message_length: 2048,
        persist_timeout_ms: 5000,
    }
}
