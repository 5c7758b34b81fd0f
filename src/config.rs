//! Configuration for Keygate
//!
//! CLI arguments and environment variable handling using clap.

use base64::Engine;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Keygate - VPN access-key provisioning and lookup service
#[derive(Parser, Debug, Clone)]
#[command(name = "keygate")]
#[command(about = "Provisions per-user VPN access keys across capacity-limited hosts")]
pub struct Args {
    /// Address the lookup endpoint listens on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// JSON file holding the host list and device counters
    #[arg(long, env = "HOSTS_FILE", default_value = "hosts.json")]
    pub hosts_file: PathBuf,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "keygate")]
    pub mongodb_db: String,

    /// Base64 encoded key for user identifier encryption (16, 24 or 32 bytes)
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Cipher used for the identifier embedded in dynamic keys
    #[arg(long, env = "ID_CIPHER", value_enum, default_value_t = IdCipherKind::AesEcb)]
    pub id_cipher: IdCipherKind,

    /// Public domain of the lookup endpoint, embedded in dynamic keys
    #[arg(long, env = "KEY_DOMAIN")]
    pub key_domain: Option<String>,

    /// Label shown by VPN clients for the connection
    #[arg(long, env = "CONNECTION_LABEL", default_value = "VPN")]
    pub connection_label: String,

    /// Prefix returned to clients by the lookup endpoint
    #[arg(long, env = "LOOKUP_PREFIX", default_value = "%13%03%03%3F")]
    pub lookup_prefix: String,

    /// Timeout for host management API calls in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Interval between expiry sweeps (followed by capacity reconciliation)
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "10800")]
    pub sweep_interval_secs: u64,

    /// Length of the free trial in days
    #[arg(long, env = "TRIAL_DAYS", default_value = "3")]
    pub trial_days: u32,

    /// Subscriptions ending within this window get a reminder
    #[arg(long, env = "REMINDER_WINDOW_HOURS", default_value = "72")]
    pub reminder_window_hours: u32,

    /// Parallel host calls during host migration
    #[arg(long, env = "MIGRATION_CONCURRENCY", default_value = "10")]
    pub migration_concurrency: usize,

    /// Enable development mode (in-memory record store, relaxed validation)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Identifier cipher selection
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdCipherKind {
    /// AES in ECB mode, compatible with already issued dynamic keys
    AesEcb,
    /// ChaCha20-Poly1305 with a random nonce per identifier
    #[value(name = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Args {
    /// Decode the configured secret key
    pub fn secret_key_bytes(&self) -> Result<Vec<u8>, String> {
        let encoded = self
            .secret_key
            .as_deref()
            .ok_or_else(|| "SECRET_KEY is required".to_string())?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("SECRET_KEY is not valid base64: {}", e))
    }

    /// Key domain, falling back to localhost in dev mode
    pub fn key_domain(&self) -> String {
        match &self.key_domain {
            Some(domain) => domain.clone(),
            None => format!("localhost:{}", self.listen.port()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let key = self.secret_key_bytes()?;
        match self.id_cipher {
            IdCipherKind::AesEcb => {
                if ![16, 24, 32].contains(&key.len()) {
                    return Err(format!(
                        "SECRET_KEY must decode to 16, 24 or 32 bytes, got {}",
                        key.len()
                    ));
                }
            }
            IdCipherKind::ChaCha20Poly1305 => {
                if key.len() != 32 {
                    return Err(format!(
                        "chacha20-poly1305 requires a 32 byte SECRET_KEY, got {}",
                        key.len()
                    ));
                }
            }
        }

        if !self.dev_mode && self.key_domain.is_none() {
            return Err("KEY_DOMAIN is required in production mode".to_string());
        }

        if self.trial_days == 0 {
            return Err("TRIAL_DAYS must be at least 1".to_string());
        }

        if self.migration_concurrency == 0 {
            return Err("MIGRATION_CONCURRENCY must be at least 1".to_string());
        }

        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_16: &str = "MDEyMzQ1Njc4OWFiY2RlZg=="; // "0123456789abcdef"

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["keygate"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--secret-key", KEY_16, "--key-domain", "vpn.example"]);
        assert_eq!(args.hosts_file, PathBuf::from("hosts.json"));
        assert_eq!(args.id_cipher, IdCipherKind::AesEcb);
        assert_eq!(args.trial_days, 3);
        assert_eq!(args.sweep_interval(), Duration::from_secs(3 * 3600));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_missing_secret_rejected() {
        let args = parse(&["--key-domain", "vpn.example"]);
        assert!(args.validate().unwrap_err().contains("SECRET_KEY"));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        // 10 bytes
        let args = parse(&["--secret-key", "MDEyMzQ1Njc4OQ==", "--key-domain", "vpn.example"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_chacha_requires_32_byte_key() {
        let args = parse(&[
            "--secret-key",
            KEY_16,
            "--key-domain",
            "vpn.example",
            "--id-cipher",
            "chacha20-poly1305",
        ]);
        assert!(args.validate().unwrap_err().contains("32 byte"));
    }

    #[test]
    fn test_key_domain_required_outside_dev_mode() {
        let args = parse(&["--secret-key", KEY_16]);
        assert!(args.validate().is_err());

        let args = parse(&["--secret-key", KEY_16, "--dev-mode"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.key_domain(), "localhost:8000");
    }
}
