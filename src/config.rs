use std::time::Duration;

pub const MAX_USERNAME_LENGTH: usize = 32;
pub const MAX_POST_LENGTH: usize = 140;
pub const MAX_ABOUT_ME_LENGTH: usize = 140;

pub const SESSION_COOKIE: &str = "session";
pub const FLASH_COOKIE: &str = "flash";

const DEFAULT_SECRET_KEY: &str = "this is very secret";
const REMEMBER_ME_HOURS: i64 = 24 * 30;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub secret_key: String,
    pub database_url: String,
    pub posts_per_page: usize,
    pub bind_addr: String,
    pub base_url: String,
    pub token_expiration_hours: i64,
    pub reset_token_expires_in: Duration,
    pub mail: Option<MailConfig>,
    pub admins: Vec<String>,
    pub seed_demo: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let secret_key = env_or("SECRET_KEY", DEFAULT_SECRET_KEY);
        if secret_key == DEFAULT_SECRET_KEY {
            tracing::warn!("SECRET_KEY is not set, falling back to the built-in development key");
        }

        let mail = std::env::var("MAIL_SERVER")
            .ok()
            .filter(|server| !server.is_empty())
            .map(|server| MailConfig {
                server,
                port: env_parse("MAIL_PORT", 25),
                use_tls: env_flag("MAIL_USE_TLS"),
                username: std::env::var("MAIL_USERNAME").ok(),
                password: std::env::var("MAIL_PASSWORD").ok(),
            });

        let admins = env_or("ADMINS", "admin@microblog.local")
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        Config {
            secret_key,
            database_url: env_or("DATABASE_URL", "sqlite://app.db"),
            posts_per_page: env_parse("POSTS_PER_PAGE", 25usize).max(1),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:5000"),
            base_url: env_or("BASE_URL", "http://localhost:5000")
                .trim_end_matches('/')
                .to_string(),
            token_expiration_hours: env_parse("MICROBLOG_TOKEN_EXPIRATION_HOURS", 24),
            reset_token_expires_in: Duration::from_secs(env_parse("RESET_TOKEN_EXPIRES_IN", 600)),
            mail,
            admins,
            seed_demo: env_flag("MICROBLOG_SEED_DEMO"),
        }
    }

    /// Settings for tests and local tooling: in-memory database, no mail server.
    pub fn for_tests() -> Self {
        Config {
            secret_key: "test secret".to_string(),
            database_url: "sqlite::memory:".to_string(),
            posts_per_page: 3,
            bind_addr: "127.0.0.1:0".to_string(),
            base_url: "http://localhost:5000".to_string(),
            token_expiration_hours: 24,
            reset_token_expires_in: Duration::from_secs(600),
            mail: None,
            admins: vec!["admin@microblog.local".to_string()],
            seed_demo: false,
        }
    }

    /// How long a login session stays valid.
    pub fn session_lifetime_hours(&self, remember_me: bool) -> i64 {
        if remember_me {
            REMEMBER_ME_HOURS.max(self.token_expiration_hours)
        } else {
            self.token_expiration_hours
        }
    }

    pub fn mail_sender(&self) -> &str {
        self.admins
            .first()
            .map(String::as_str)
            .unwrap_or("admin@microblog.local")
    }
}
