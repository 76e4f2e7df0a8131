//! System configuration parameters
//!
//! All tunable parameters for the fill controller.  Values are fixed at
//! process start (defaults, optionally overridden from the environment)
//! and never change while the controller runs.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fill-cycle parameters consumed by the state machine and timing supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    // --- Fill target ---
    /// Nominal fill volume (mL)
    pub target_level_ml: f32,
    /// Half-width of the acceptance band (mL)
    pub tolerance_ml: f32,

    // --- Deadlines ---
    /// Max time from can detection to a position report (ms)
    pub position_timeout_ms: u32,
    /// Max time from valve open to reaching the fill threshold (ms)
    pub max_fill_time_ms: u32,

    // --- Reset delays ---
    /// Pause after COMPLETE before accepting the next can (ms)
    pub settle_delay_ms: u32,
    /// Pause after FAULT before accepting the next can (ms)
    pub fault_recovery_delay_ms: u32,

    // --- Reporting ---
    /// Statistics report interval (seconds)
    pub stats_interval_secs: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_level_ml: 330.0,
            tolerance_ml: 5.0,

            position_timeout_ms: 200,
            max_fill_time_ms: 3000,

            settle_delay_ms: 500,
            fault_recovery_delay_ms: 2000,

            stats_interval_secs: 60,
        }
    }
}

impl ControllerConfig {
    /// Lowest level that ends filling (`target - tolerance`).
    pub fn fill_threshold_ml(&self) -> f32 {
        self.target_level_ml - self.tolerance_ml
    }

    /// True if `level_ml` lies in the inclusive tolerance band.
    pub fn within_tolerance(&self, level_ml: f32) -> bool {
        let lo = self.target_level_ml - self.tolerance_ml;
        let hi = self.target_level_ml + self.tolerance_ml;
        level_ml >= lo && level_ml <= hi
    }

    pub fn position_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.position_timeout_ms))
    }

    pub fn max_fill_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_fill_time_ms))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.settle_delay_ms))
    }

    pub fn fault_recovery_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.fault_recovery_delay_ms))
    }
}

/// Message bus connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Extra attempts after a failed publish before the command is dropped.
    pub publish_retries: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fill_controller".into(),
            publish_retries: 3,
        }
    }
}

/// Persistence sink parameters.
///
/// The database fields describe the production store; the controller
/// itself writes through [`RecordSink`](crate::app::ports::RecordSink) and
/// the bundled binary journals to `journal_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub journal_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: "filling_db".into(),
            user: "filling_user".into(),
            password: "filling_pass".into(),
            journal_path: "filling_events.jsonl".into(),
        }
    }
}

/// Bus topic names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub can_detected: String,
    pub position: String,
    pub level: String,
    pub valve_command: String,
    /// Observe-only quality verdicts; never gates a transition.
    pub quality: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            can_detected: "sensor/can_detected".into(),
            position: "sensor/position".into(),
            level: "sensor/level".into(),
            valve_command: "valve/command".into(),
            quality: "status/quality".into(),
        }
    }
}

/// Core system configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub controller: ControllerConfig,
    pub bus: BusConfig,
    pub persistence: PersistenceConfig,
    pub topics: TopicConfig,
}

impl SystemConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        // Bus
        set_string(&lookup, "MQTT_BROKER", &mut cfg.bus.host);
        set_parsed(&lookup, "MQTT_PORT", &mut cfg.bus.port)?;
        set_string(&lookup, "MQTT_CLIENT_ID", &mut cfg.bus.client_id);

        // Persistence
        set_string(&lookup, "DB_HOST", &mut cfg.persistence.host);
        set_parsed(&lookup, "DB_PORT", &mut cfg.persistence.port)?;
        set_string(&lookup, "DB_NAME", &mut cfg.persistence.database);
        set_string(&lookup, "DB_USER", &mut cfg.persistence.user);
        set_string(&lookup, "DB_PASSWORD", &mut cfg.persistence.password);
        set_string(&lookup, "JOURNAL_PATH", &mut cfg.persistence.journal_path);

        // Controller
        let c = &mut cfg.controller;
        set_parsed(&lookup, "FILL_TARGET_ML", &mut c.target_level_ml)?;
        set_parsed(&lookup, "FILL_TOLERANCE_ML", &mut c.tolerance_ml)?;
        set_parsed(&lookup, "POSITION_TIMEOUT_MS", &mut c.position_timeout_ms)?;
        set_parsed(&lookup, "MAX_FILL_TIME_MS", &mut c.max_fill_time_ms)?;
        set_parsed(&lookup, "SETTLE_DELAY_MS", &mut c.settle_delay_ms)?;
        set_parsed(&lookup, "FAULT_RECOVERY_DELAY_MS", &mut c.fault_recovery_delay_ms)?;
        set_parsed(&lookup, "STATS_INTERVAL_SECS", &mut c.stats_interval_secs)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field.  Invalid values are rejected, not clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.controller;
        if !c.target_level_ml.is_finite() || c.target_level_ml <= 0.0 {
            return Err(ConfigError::ValidationFailed("target_level_ml must be > 0"));
        }
        if !c.tolerance_ml.is_finite() || c.tolerance_ml < 0.0 {
            return Err(ConfigError::ValidationFailed("tolerance_ml must be >= 0"));
        }
        if c.tolerance_ml >= c.target_level_ml {
            return Err(ConfigError::ValidationFailed(
                "tolerance_ml must be below target_level_ml",
            ));
        }
        if c.position_timeout_ms == 0 || c.max_fill_time_ms == 0 {
            return Err(ConfigError::ValidationFailed("deadlines must be non-zero"));
        }
        if c.settle_delay_ms == 0 || c.fault_recovery_delay_ms == 0 {
            return Err(ConfigError::ValidationFailed("reset delays must be non-zero"));
        }
        if self.bus.port == 0 || self.persistence.port == 0 {
            return Err(ConfigError::ValidationFailed("ports must be non-zero"));
        }
        Ok(())
    }
}

fn set_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut String) {
    if let Some(v) = lookup(key) {
        *slot = v;
    }
}

fn set_parsed<T: core::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup(key) {
        *slot = v.trim().parse().map_err(|_| ConfigError::Invalid(key))?;
    }
    Ok(())
}
