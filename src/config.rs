//! Configuration for the rondo service.
//!
//! Nested sections with sane defaults, logical validation, and TOML loading.

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RondoConfig {
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

/// Game variant. A variant only fixes the round capacity and a display
/// label; all variants share the engine code path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameVariant {
    Duel,
    FiveSeat,
    TenSeat,
}

impl GameVariant {
    pub fn capacity(self) -> usize {
        match self {
            GameVariant::Duel => 2,
            GameVariant::FiveSeat => 5,
            GameVariant::TenSeat => 10,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GameVariant::Duel => "duel",
            GameVariant::FiveSeat => "five-seat",
            GameVariant::TenSeat => "ten-seat",
        }
    }
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Core engine parameters. Entry fee and capacity are fixed for the
/// lifetime of an engine instance; every round shares them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub variant: GameVariant,
    pub entry_fee_lamports: u64,
    pub platform_fee_percent: u64,
    pub referral_percent: u64,
    pub refund_timeout_secs: u64,
    pub owner: String,
    pub fee_receiver: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            variant: GameVariant::FiveSeat,
            entry_fee_lamports: 10_000_000, // 0.01 SOL
            platform_fee_percent: 6,
            referral_percent: 2,
            refund_timeout_secs: 86_400, // 24h
            owner: "operator".to_string(),
            fee_receiver: "operator:fees".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn refund_timeout(&self) -> Duration {
        Duration::from_secs(self.refund_timeout_secs)
    }
}

/// HTTP surface configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub enable_cors: bool,
    /// Shared secret for the admin endpoints; unset disables them.
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            enable_cors: true,
            admin_token: None,
        }
    }
}

impl RondoConfig {
    /// Validate logical consistency before wiring anything up.
    pub fn validate(&self) -> EngineResult<()> {
        let engine = &self.engine;
        if engine.entry_fee_lamports == 0 {
            return Err(EngineError::Config(
                "entry_fee_lamports must be > 0".to_string(),
            ));
        }
        if engine.platform_fee_percent >= 100 {
            return Err(EngineError::Config(
                "platform_fee_percent must be < 100".to_string(),
            ));
        }
        if engine.referral_percent > engine.platform_fee_percent {
            // The referral share is carved out of the platform fee; letting it
            // exceed the gross fee would force the net-fee clamp on every round.
            return Err(EngineError::Config(
                "referral_percent must not exceed platform_fee_percent".to_string(),
            ));
        }
        if engine.refund_timeout_secs == 0 {
            return Err(EngineError::Config(
                "refund_timeout_secs must be > 0".to_string(),
            ));
        }
        if engine.owner.is_empty() || engine.fee_receiver.is_empty() {
            return Err(EngineError::Config(
                "owner and fee_receiver must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RondoConfig::default().validate().is_ok());
    }

    #[test]
    fn test_variant_capacities() {
        assert_eq!(GameVariant::Duel.capacity(), 2);
        assert_eq!(GameVariant::FiveSeat.capacity(), 5);
        assert_eq!(GameVariant::TenSeat.capacity(), 10);
        assert_eq!(GameVariant::TenSeat.to_string(), "ten-seat");
    }

    #[test]
    fn test_referral_percent_must_fit_in_platform_fee() {
        let mut config = RondoConfig::default();
        config.engine.referral_percent = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_entry_fee_rejected() {
        let mut config = RondoConfig::default();
        config.engine.entry_fee_lamports = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine]
variant = "duel"
entry_fee_lamports = 10000000

[api]
bind_port = 9090
"#
        )
        .unwrap();

        let config = RondoConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.variant, GameVariant::Duel);
        assert_eq!(config.engine.platform_fee_percent, 6);
        assert_eq!(config.api.bind_port, 9090);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nentry_fee_lamports = 0").unwrap();
        assert!(RondoConfig::load(file.path()).is_err());
    }
}
