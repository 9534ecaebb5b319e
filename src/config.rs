use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::error::ChatError;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub token_secret: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub membership_file: Option<PathBuf>,
    pub max_message_len: usize,
    pub max_page_size: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ChatError> {
        let token_secret = env::var("CHAT_TOKEN_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ChatError::Config("CHAT_TOKEN_SECRET must be set".to_string()))?;

        Ok(ServerConfig {
            bind_addr: parse_var("CHAT_BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?,
            port: parse_var("CHAT_PORT", 2052)?,
            token_secret,
            tls_cert: env::var("CHAT_TLS_CERT").ok().map(PathBuf::from),
            tls_key: env::var("CHAT_TLS_KEY").ok().map(PathBuf::from),
            membership_file: env::var("CHAT_MEMBERSHIP_FILE").ok().map(PathBuf::from),
            max_message_len: parse_var("CHAT_MAX_MESSAGE_LEN", 4000)?,
            max_page_size: parse_var("CHAT_MAX_PAGE_SIZE", 100)?,
        })
    }

    /// Defaults for tests and local tooling.
    pub fn with_secret(token_secret: impl Into<String>) -> Self {
        ServerConfig {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            token_secret: token_secret.into(),
            tls_cert: None,
            tls_key: None,
            membership_file: None,
            max_message_len: 4000,
            max_page_size: 100,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ChatError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ChatError::Config(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Reconnection policy of the client connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl Backoff {
    /// Exponential delay for the given 1-based attempt, capped at `max`,
    /// with up to 20% random jitter on top.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial.saturating_mul(1 << exponent).min(self.max);
        let jitter_ms = u64::try_from(base.as_millis() / 5).unwrap_or(0);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:2052/chat`.
    pub url: String,
    pub token: String,
    pub backoff: Backoff,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            token: token.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_attempts: 5,
        };
        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));

        let third = backoff.delay(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(480));

        let late = backoff.delay(30);
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1200));
    }

    #[test]
    fn test_config_binds_loopback_ephemeral() {
        let config = ServerConfig::with_secret("s");
        assert_eq!(config.socket_addr().port(), 0);
        assert!(config.socket_addr().ip().is_loopback());
    }
}
