//! Environment-based configuration.

use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::model::WorldKind;

const DEFAULT_VALIDITY_TIMEOUT_MS: u64 = 60_000;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Role of this world (`client` or `executor`)
    pub world_kind: WorldKind,

    /// Startup validity sweeps; unset applies the kind default
    pub auto_validity_check: Option<bool>,

    /// How long a heartbeat is trusted, in milliseconds
    pub validity_timeout_ms: u64,

    /// Heartbeat refresh interval, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Claim the delayed-dispatch role on startup
    pub delayed_executor: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let world_kind = match std::env::var("STEWARD_WORLD_KIND") {
            Ok(value) => WorldKind::parse(&value)
                .ok_or_else(|| anyhow::anyhow!("invalid STEWARD_WORLD_KIND: {value}"))?,
            Err(_) => WorldKind::Executor,
        };

        let auto_validity_check = std::env::var("STEWARD_AUTO_VALIDITY_CHECK")
            .ok()
            .and_then(|s| s.parse().ok());

        let validity_timeout_ms: u64 = std::env::var("STEWARD_VALIDITY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_VALIDITY_TIMEOUT_MS);

        let heartbeat_interval_ms: u64 = std::env::var("STEWARD_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(validity_timeout_ms / 3);

        let delayed_executor: bool = std::env::var("STEWARD_DELAYED_EXECUTOR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        Ok(Config {
            world_kind,
            auto_validity_check,
            validity_timeout_ms,
            heartbeat_interval_ms,
            delayed_executor,
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            kind: self.world_kind,
            auto_validity_check: self.auto_validity_check,
            validity_timeout: Duration::from_millis(self.validity_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            delayed_executor: self.delayed_executor,
        }
    }
}
