//! Driver configuration management

use crate::usb::session::{ClaimPolicy, ClaimRetry};
use crate::usb::transport::RetryPolicy;
use ambx_protocol::BatchHeaders;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Value of `batch_header` that selects the rotating header sequence
pub const ROTATING_HEADER: &str = "rotating";

/// Retries are always separated by at least this long
const MIN_RETRY_DELAY_MS: u64 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmbxConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    /// Per-device session behavior
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Session tuning
///
/// # Example Configuration
/// ```toml
/// [session]
/// claim_policy = "per-operation"
/// transfer_timeout_ms = 250
/// batch_header = "0xa4"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// When the interface is claimed (hold, per-operation)
    pub claim_policy: ClaimPolicy,
    /// Claim attempts before giving up
    pub claim_attempts: u32,
    /// Fixed delay between claim attempts (at least 1 ms)
    pub claim_retry_delay_ms: u64,
    /// Attempts per packet transfer
    pub transfer_attempts: u32,
    /// Linear backoff step between transfer attempts (at least 1 ms)
    pub transfer_backoff_ms: u64,
    /// Timeout of a single interrupt transfer
    pub transfer_timeout_ms: u64,
    /// Pause after a single-light packet
    pub single_packet_delay_ms: u64,
    /// Pause after a batch packet
    pub batch_packet_delay_ms: u64,
    /// "rotating" or a fixed header byte in hex (e.g. "0xa4")
    pub batch_header: String,
    /// Detach a bound kernel driver before claiming
    pub detach_kernel_driver: bool,
    /// Switch lights off once the session is open
    pub blank_on_open: bool,
    /// Switch lights off during teardown
    pub blank_on_close: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            claim_policy: ClaimPolicy::default(),
            claim_attempts: 3,
            claim_retry_delay_ms: 20,
            transfer_attempts: 3,
            transfer_backoff_ms: 10,
            transfer_timeout_ms: 100,
            single_packet_delay_ms: 2,
            batch_packet_delay_ms: 5,
            batch_header: ROTATING_HEADER.to_string(),
            detach_kernel_driver: true,
            blank_on_open: true,
            blank_on_close: true,
        }
    }
}

impl SessionSettings {
    pub fn claim_retry(&self) -> ClaimRetry {
        ClaimRetry {
            attempts: self.claim_attempts,
            delay: Duration::from_millis(self.claim_retry_delay_ms.max(MIN_RETRY_DELAY_MS)),
        }
    }

    pub fn transfer_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.transfer_attempts,
            backoff_step: Duration::from_millis(self.transfer_backoff_ms.max(MIN_RETRY_DELAY_MS)),
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn single_packet_delay(&self) -> Duration {
        Duration::from_millis(self.single_packet_delay_ms)
    }

    pub fn batch_packet_delay(&self) -> Duration {
        Duration::from_millis(self.batch_packet_delay_ms)
    }

    /// Header source for a new session
    ///
    /// Unparseable values fall back to rotation; [`AmbxConfig::validate`]
    /// rejects them at load time.
    pub fn batch_headers(&self) -> BatchHeaders {
        parse_batch_header(&self.batch_header)
            .ok()
            .flatten()
            .map_or_else(BatchHeaders::rotating, BatchHeaders::Fixed)
    }
}

/// `None` for rotation, `Some(byte)` for a fixed header
fn parse_batch_header(value: &str) -> Result<Option<u8>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case(ROTATING_HEADER) {
        return Ok(None);
    }

    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if hex.is_empty() || hex.len() > 2 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid batch_header '{}', expected \"rotating\" or a hex byte (e.g. \"0xa4\")",
            value
        ));
    }

    u8::from_str_radix(hex, 16)
        .map(Some)
        .map_err(|_| anyhow!("Invalid batch_header '{}', not a valid hex byte", value))
}

impl AmbxConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/ambx/ambx.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AmbxConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ambx").join("ambx.toml")
        } else {
            PathBuf::from(".config/ambx/ambx.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        let session = &self.session;
        if session.claim_attempts == 0 {
            return Err(anyhow!("claim_attempts must be at least 1"));
        }
        if session.transfer_attempts == 0 {
            return Err(anyhow!("transfer_attempts must be at least 1"));
        }
        if session.claim_retry_delay_ms == 0 {
            return Err(anyhow!("claim_retry_delay_ms must be greater than 0"));
        }
        if session.transfer_backoff_ms == 0 {
            return Err(anyhow!("transfer_backoff_ms must be greater than 0"));
        }
        if session.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than 0"));
        }

        parse_batch_header(&session.batch_header)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AmbxConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.session.claim_policy, ClaimPolicy::Hold);
        assert!(config.session.blank_on_open);
        assert!(config.session.blank_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_parameters() {
        let session = SessionSettings::default();
        assert_eq!(
            session.claim_retry(),
            ClaimRetry {
                attempts: 3,
                delay: Duration::from_millis(20),
            }
        );
        assert_eq!(session.transfer_retry(), RetryPolicy::default());
        assert_eq!(session.transfer_timeout(), Duration::from_millis(100));
        assert_eq!(session.single_packet_delay(), Duration::from_millis(2));
        assert_eq!(session.batch_packet_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_zero_retry_delays_are_raised() {
        let session = SessionSettings {
            claim_retry_delay_ms: 0,
            transfer_backoff_ms: 0,
            ..SessionSettings::default()
        };
        assert_eq!(session.claim_retry().delay, Duration::from_millis(1));
        assert_eq!(session.transfer_retry().backoff_step, Duration::from_millis(1));
    }

    #[test]
    fn test_general_table_without_log_level() {
        let parsed: AmbxConfig = toml::from_str("[general]\n").unwrap();
        assert_eq!(parsed.general.log_level, "info");
    }

    #[test]
    fn test_batch_header_values() {
        assert_eq!(parse_batch_header("rotating").unwrap(), None);
        assert_eq!(parse_batch_header("Rotating").unwrap(), None);
        assert_eq!(parse_batch_header("0xa4").unwrap(), Some(0xA4));
        assert_eq!(parse_batch_header("C4").unwrap(), Some(0xC4));
        assert!(parse_batch_header("0x").is_err());
        assert!(parse_batch_header("0x1ff").is_err());
        assert!(parse_batch_header("zz").is_err());
        assert!(parse_batch_header("+a").is_err());
        assert!(parse_batch_header("0x+a").is_err());
        assert_eq!(parse_batch_header("0XE4").unwrap(), Some(0xE4));
    }

    #[test]
    fn test_batch_headers_from_settings() {
        let mut session = SessionSettings::default();
        assert_eq!(session.batch_headers(), BatchHeaders::rotating());

        session.batch_header = "0x84".to_string();
        assert_eq!(session.batch_headers(), BatchHeaders::Fixed(0x84));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AmbxConfig::default();
        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AmbxConfig::default();
        config.session.claim_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AmbxConfig::default();
        config.session.transfer_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AmbxConfig::default();
        config.session.claim_retry_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AmbxConfig::default();
        config.session.transfer_backoff_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AmbxConfig::default();
        config.session.batch_header = "sometimes".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = AmbxConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: AmbxConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.general.log_level, parsed.general.log_level);
        assert_eq!(config.session, parsed.session);
    }

    #[test]
    fn test_partial_session_table_uses_defaults() {
        let parsed: AmbxConfig = toml::from_str(
            r#"
[session]
claim_policy = "per-operation"
"#,
        )
        .unwrap();

        assert_eq!(parsed.general.log_level, "info");
        assert_eq!(parsed.session.claim_policy, ClaimPolicy::PerOperation);
        assert_eq!(parsed.session.claim_attempts, 3);
        assert!(parsed.session.detach_kernel_driver);
    }
}
