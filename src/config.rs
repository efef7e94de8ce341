use std::env;

const DEFAULT_UPLOAD_TTL_SECS: u64 = 300;
pub const MIN_UPLOAD_TTL_SECS: u64 = 30;
pub const MAX_UPLOAD_TTL_SECS: u64 = 900;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub public_base_url: String,
    pub admin_key: Option<String>,
    pub static_tokens: Option<String>,
    pub static_tokens_file: Option<String>,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_key: Option<String>,
    pub payment_timeout_secs: u64,
    pub payment_currency: String,
    pub upload_session_ttl_secs: u64,
    pub upload_session_max_images: usize,
    pub reservation_code_prefix: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let upload_ttl: u64 = parse_var("UPLOAD_SESSION_TTL_SECS", DEFAULT_UPLOAD_TTL_SECS)?;

        Ok(Config {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "rufs.db".to_string()),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            admin_key: env::var("ADMIN_KEY").ok(),
            static_tokens: env::var("STATIC_TOKENS").ok(),
            static_tokens_file: env::var("STATIC_TOKENS_FILE").ok(),
            payment_gateway_url: env::var("PAYMENT_GATEWAY_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            payment_gateway_key: env::var("PAYMENT_GATEWAY_KEY").ok(),
            payment_timeout_secs: parse_var("PAYMENT_TIMEOUT_SECS", 10)?,
            payment_currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
            upload_session_ttl_secs: upload_ttl.clamp(MIN_UPLOAD_TTL_SECS, MAX_UPLOAD_TTL_SECS),
            upload_session_max_images: parse_var("UPLOAD_SESSION_MAX_IMAGES", 20)?,
            reservation_code_prefix: env::var("RESERVATION_CODE_PREFIX")
                .unwrap_or_else(|_| "RUFS".to_string()),
        })
    }

    /// A self-contained configuration: sandbox gateway, no admin key.
    pub fn local(database_url: &str) -> Self {
        Config {
            bind_addr: "127.0.0.1:3000".to_string(),
            database_url: database_url.to_string(),
            public_base_url: "http://localhost:3000".to_string(),
            admin_key: None,
            static_tokens: None,
            static_tokens_file: None,
            payment_gateway_url: None,
            payment_gateway_key: None,
            payment_timeout_secs: 10,
            payment_currency: "usd".to_string(),
            upload_session_ttl_secs: DEFAULT_UPLOAD_TTL_SECS,
            upload_session_max_images: 20,
            reservation_code_prefix: "RUFS".to_string(),
        }
    }

    pub fn uses_sandbox_gateway(&self) -> bool {
        self.payment_gateway_url.is_none()
    }
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be a number: {}", key, e)),
        Err(_) => Ok(default),
    }
}
