use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chatproto::{MAX_USERNAME_LENGTH, MIN_USERNAME_LENGTH};

/// Server configuration, read from the environment at startup. A `.env`
/// file in the working directory is preloaded when present.
#[derive(Clone)]
pub struct Config {
    pub tcp_port: String,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_email: String,
    pub smtp_password: String,

    pub otp_expiration_minutes: u64,
    pub otp_max_retries: u32,

    pub username_min_length: usize,
    pub username_max_length: usize,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Missing .env is fine; the environment alone is a valid source.
        let _ = dotenvy::dotenv();

        let cfg = Self {
            tcp_port: env_or("TCP_PORT", "8888"),
            smtp_host: env_or("SMTP_HOST", "smtp.gmail.com"),
            smtp_port: env_or_parse("SMTP_PORT", 587),
            smtp_email: env_or("SMTP_EMAIL", ""),
            smtp_password: env_or("SMTP_PASSWORD", ""),
            otp_expiration_minutes: env_or_parse("OTP_EXPIRATION_MINUTES", 5),
            otp_max_retries: env_or_parse("OTP_MAX_RETRIES", 3),
            username_min_length: env_or_parse("USERNAME_MIN_LENGTH", MIN_USERNAME_LENGTH),
            username_max_length: env_or_parse("USERNAME_MAX_LENGTH", MAX_USERNAME_LENGTH),
        };

        if cfg.smtp_email.is_empty() {
            anyhow::bail!("SMTP_EMAIL is required");
        }
        if cfg.smtp_password.is_empty() {
            anyhow::bail!("SMTP_PASSWORD is required");
        }

        Ok(cfg)
    }

    pub fn otp_expiration(&self) -> Duration {
        Duration::from_secs(self.otp_expiration_minutes * 60)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tcp_port", &self.tcp_port)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_email", &self.smtp_email)
            .field("smtp_password", &"<redacted>")
            .field("otp_expiration_minutes", &self.otp_expiration_minutes)
            .field("otp_max_retries", &self.otp_max_retries)
            .field("username_min_length", &self.username_min_length)
            .field("username_max_length", &self.username_max_length)
            .finish()
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Unparsable values fall back to the default rather than failing startup.
fn env_or_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}
