// =============================================================================
// Engine Configuration — file-backed settings with env overrides
// =============================================================================
//
// Central configuration hub for the Meridian engine. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading
// an older config file.
//
// Policy gates (TRADING_ENABLED, DATA_FEED_MODE, RELAY_URL) come from the
// environment and override whatever the file says; everything else is
// file-tunable.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "RELIANCE".to_string(),
        "TCS".to_string(),
        "INFY".to_string(),
        "HDFCBANK".to_string(),
        "SBIN".to_string(),
    ]
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_intake_bind_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_pending_timeout_secs() -> u64 {
    600
}

fn default_placed_timeout_secs() -> u64 {
    600
}

fn default_reconcile_period_secs() -> u64 {
    30
}

fn default_pending_initial_delay_secs() -> u64 {
    10
}

fn default_exit_initial_delay_secs() -> u64 {
    15
}

fn default_max_concurrent_broker_calls() -> usize {
    5
}

fn default_max_holding_days() -> i64 {
    30
}

fn default_stale_feed_secs() -> u64 {
    300
}

fn default_finalizer_period_secs() -> u64 {
    2
}

fn default_dedup_rotate_secs() -> u64 {
    60
}

// =============================================================================
// Feed mode
// =============================================================================

/// Where market ticks come from: the broker's own WebSocket, or a read-only
/// relay that re-broadcasts another process's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFeedMode {
    Direct,
    Relay,
}

impl Default for DataFeedMode {
    fn default() -> Self {
        Self::Direct
    }
}

impl DataFeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIRECT" => Some(Self::Direct),
            "RELAY" => Some(Self::Relay),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataFeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "DIRECT"),
            Self::Relay => write!(f, "RELAY"),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Policy gates --------------------------------------------------------
    /// Master switch for live entry-order placement. Defaults to OFF; the
    /// reconcilers and the market-data pipeline run regardless.
    #[serde(default)]
    pub trading_enabled: bool,

    /// Tick source selection.
    #[serde(default)]
    pub data_feed_mode: DataFeedMode,

    /// Relay WebSocket URL; required when `data_feed_mode` is RELAY.
    #[serde(default)]
    pub relay_url: Option<String>,

    // --- Universe ------------------------------------------------------------
    /// Symbols the engine subscribes to and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Storage -------------------------------------------------------------
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Intent ingress ------------------------------------------------------
    /// Local TCP address where the strategy layer delivers approved intents
    /// as JSON lines.
    #[serde(default = "default_intake_bind_addr")]
    pub intake_bind_addr: String,

    // --- Broker --------------------------------------------------------------
    /// Override for the broker tick WebSocket URL (adapter default otherwise).
    #[serde(default)]
    pub broker_ws_url: Option<String>,

    // --- Reconcilers ---------------------------------------------------------
    /// A PENDING entry order older than this is rejected with TIMEOUT.
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,

    /// A PLACED exit order older than this is failed with TIMEOUT.
    #[serde(default = "default_placed_timeout_secs")]
    pub placed_timeout_secs: u64,

    #[serde(default = "default_reconcile_period_secs")]
    pub pending_reconcile_period_secs: u64,

    #[serde(default = "default_reconcile_period_secs")]
    pub exit_reconcile_period_secs: u64,

    #[serde(default = "default_pending_initial_delay_secs")]
    pub pending_reconcile_initial_delay_secs: u64,

    #[serde(default = "default_exit_initial_delay_secs")]
    pub exit_reconcile_initial_delay_secs: u64,

    /// Semaphore permits bounding concurrent broker status calls per
    /// reconciler.
    #[serde(default = "default_max_concurrent_broker_calls")]
    pub max_concurrent_broker_calls: usize,

    // --- Trade management ----------------------------------------------------
    /// Time-based exit trigger: close a trade held at least this many days.
    #[serde(default = "default_max_holding_days")]
    pub max_holding_days: i64,

    // --- Market data ---------------------------------------------------------
    /// The feed counts as stale after this many seconds without a tick;
    /// order placement is refused while stale.
    #[serde(default = "default_stale_feed_secs")]
    pub stale_feed_secs: u64,

    /// Period of the partial-candle finalizer task.
    #[serde(default = "default_finalizer_period_secs")]
    pub finalizer_period_secs: u64,

    /// Period of the tick-dedup window rotation.
    #[serde(default = "default_dedup_rotate_secs")]
    pub dedup_rotate_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trading_enabled: false,
            data_feed_mode: DataFeedMode::Direct,
            relay_url: None,
            symbols: default_symbols(),
            db_path: default_db_path(),
            intake_bind_addr: default_intake_bind_addr(),
            broker_ws_url: None,
            pending_timeout_secs: default_pending_timeout_secs(),
            placed_timeout_secs: default_placed_timeout_secs(),
            pending_reconcile_period_secs: default_reconcile_period_secs(),
            exit_reconcile_period_secs: default_reconcile_period_secs(),
            pending_reconcile_initial_delay_secs: default_pending_initial_delay_secs(),
            exit_reconcile_initial_delay_secs: default_exit_initial_delay_secs(),
            max_concurrent_broker_calls: default_max_concurrent_broker_calls(),
            max_holding_days: default_max_holding_days(),
            stale_feed_secs: default_stale_feed_secs(),
            finalizer_period_secs: default_finalizer_period_secs(),
            dedup_rotate_secs: default_dedup_rotate_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            feed_mode = %config.data_feed_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides on top of whatever the file said.
    ///
    /// `TRADING_ENABLED`, `DATA_FEED_MODE`, `RELAY_URL`, `MERIDIAN_SYMBOLS`
    /// (comma-separated), `MERIDIAN_DB_PATH` and `BROKER_WS_URL` are
    /// recognised. Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRADING_ENABLED") {
            match v.trim().to_ascii_lowercase().as_str() {
                "true" => self.trading_enabled = true,
                "false" => self.trading_enabled = false,
                other => warn!(value = other, "ignoring unparseable TRADING_ENABLED"),
            }
        }

        if let Ok(v) = std::env::var("DATA_FEED_MODE") {
            match DataFeedMode::parse(&v) {
                Some(mode) => self.data_feed_mode = mode,
                None => warn!(value = %v, "ignoring unparseable DATA_FEED_MODE"),
            }
        }

        if let Ok(v) = std::env::var("RELAY_URL") {
            if !v.trim().is_empty() {
                self.relay_url = Some(v.trim().to_string());
            }
        }

        if let Ok(v) = std::env::var("MERIDIAN_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }

        if let Ok(v) = std::env::var("MERIDIAN_DB_PATH") {
            if !v.trim().is_empty() {
                self.db_path = v.trim().to_string();
            }
        }

        if let Ok(v) = std::env::var("MERIDIAN_INTAKE_ADDR") {
            if !v.trim().is_empty() {
                self.intake_bind_addr = v.trim().to_string();
            }
        }

        if let Ok(v) = std::env::var("BROKER_WS_URL") {
            if !v.trim().is_empty() {
                self.broker_ws_url = Some(v.trim().to_string());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!(!cfg.trading_enabled);
        assert_eq!(cfg.data_feed_mode, DataFeedMode::Direct);
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "RELIANCE");
        assert_eq!(cfg.pending_timeout_secs, 600);
        assert_eq!(cfg.placed_timeout_secs, 600);
        assert_eq!(cfg.pending_reconcile_period_secs, 30);
        assert_eq!(cfg.max_concurrent_broker_calls, 5);
        assert_eq!(cfg.max_holding_days, 30);
        assert_eq!(cfg.stale_feed_secs, 300);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(!cfg.trading_enabled);
        assert_eq!(cfg.data_feed_mode, DataFeedMode::Direct);
        assert_eq!(cfg.db_path, "meridian.db");
        assert_eq!(cfg.intake_bind_addr, "127.0.0.1:7400");
        assert_eq!(cfg.exit_reconcile_initial_delay_secs, 15);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_enabled": true, "symbols": ["ACME"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.trading_enabled);
        assert_eq!(cfg.symbols, vec!["ACME"]);
        assert_eq!(cfg.pending_timeout_secs, 600);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.data_feed_mode, cfg2.data_feed_mode);
        assert_eq!(cfg.max_holding_days, cfg2.max_holding_days);
    }

    #[test]
    fn feed_mode_parsing() {
        assert_eq!(DataFeedMode::parse("DIRECT"), Some(DataFeedMode::Direct));
        assert_eq!(DataFeedMode::parse("relay"), Some(DataFeedMode::Relay));
        assert_eq!(DataFeedMode::parse("bogus"), None);
    }
}
