//! Configuration management with validation and defaults
//!
//! Two layers:
//! - [`AppConfig`]: static settings loaded once at start (TOML file plus
//!   `CASINO_*` environment overrides).
//! - [`RuntimeConfig`]: house-edge and retention knobs that can be changed
//!   while the engine runs. Consumers take a snapshot per evaluation through
//!   [`RuntimeConfigHandle`], which can follow a file on disk.

use crate::amount::Amount;
use crate::errors::{LedgerError, LedgerResult};
use crate::lottery::types::{FundingRule, SlotTemplate};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Static configuration for the whole engine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime_config_path: Option<String>,
    pub storage: StorageConfig,
    pub coordinator: CoordinatorConfig,
    pub settlement: SettlementConfig,
    pub lottery: LotteryConfig,
    /// Initial runtime values; replaced by `runtime_config_path` if set.
    pub runtime: RuntimeConfig,
}

/// Storage configuration with optimization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    /// How long a transaction waits for a row lock before reporting a conflict.
    pub lock_timeout_ms: i64,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/ledger_data".to_string(),
            write_buffer_size_mb: 64,
            lock_timeout_ms: 1_000,
            clear_on_start: false,
        }
    }
}

/// Retry policy for the transaction coordinator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Per-user advisory round lock lifetime.
    pub round_lock_ttl_ms: u64,
    pub min_bet: Amount,
    pub max_bet: Amount,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            round_lock_ttl_ms: 3_000,
            min_bet: Amount::from_micros(10_000),
            max_bet: Amount::units(1_000_000),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LotteryConfig {
    pub tick_interval_secs: u64,
    pub reveal_delay_secs: u64,
    /// DRAWING slots older than this are force-finalized.
    pub stuck_grace_secs: u64,
    /// Purchases are rejected this close to `end_time`.
    pub purchase_lock_window_secs: u64,
    pub max_tickets_per_purchase: u32,
    pub funding_rule: FundingRule,
    pub templates: Vec<SlotTemplate>,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            reveal_delay_secs: 7,
            stuck_grace_secs: 60,
            purchase_lock_window_secs: 60,
            max_tickets_per_purchase: 100,
            funding_rule: FundingRule::TotalSales,
            templates: SlotTemplate::defaults(),
        }
    }
}

impl LotteryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn reveal_delay(&self) -> Duration {
        Duration::from_secs(self.reveal_delay_secs)
    }
}

/// Hot-reloadable knobs
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub profit: ProfitConfig,
    pub odds: OddsConfig,
    pub retention: RetentionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfitConfig {
    pub margin_percent: f64,
    pub vault_tax_percent: f64,
    pub window_hours: u32,
    /// Below this much trailing volume small payouts are always allowed.
    pub cold_start_bets: Amount,
    pub cold_start_max_payout: Amount,
    pub per_game_pools: bool,
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            margin_percent: 30.0,
            vault_tax_percent: 5.0,
            window_hours: 24,
            cold_start_bets: Amount::units(1000),
            cold_start_max_payout: Amount::units(50),
            per_game_pools: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OddsConfig {
    pub base_win_probability: f64,
    pub loyalty_boost: f64,
    pub max_win_probability: f64,
    /// Rounds within the loyalty window needed for the boost.
    pub loyalty_min_rounds: u64,
    pub loyalty_window_hours: u32,
}

impl Default for OddsConfig {
    fn default() -> Self {
        Self {
            base_win_probability: 0.45,
            loyalty_boost: 0.12,
            max_win_probability: 0.80,
            loyalty_min_rounds: 50,
            loyalty_window_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub big_win_threshold: Amount,
    pub lock_multiplier: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            big_win_threshold: Amount::units(1000),
            lock_multiplier: 20,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> LedgerResult<()> {
        let p = &self.profit;
        if !(0.0..=100.0).contains(&p.margin_percent) {
            return Err(LedgerError::config("profit.margin_percent", p.margin_percent, "must be within 0..=100"));
        }
        if !(0.0..=100.0).contains(&p.vault_tax_percent) {
            return Err(LedgerError::config("profit.vault_tax_percent", p.vault_tax_percent, "must be within 0..=100"));
        }
        if p.margin_percent + p.vault_tax_percent > 100.0 {
            return Err(LedgerError::config(
                "profit.margin_percent",
                p.margin_percent,
                "margin plus vault tax cannot exceed 100",
            ));
        }
        if p.window_hours == 0 {
            return Err(LedgerError::config("profit.window_hours", 0, "window cannot be empty"));
        }

        let o = &self.odds;
        for (field, value) in [
            ("odds.base_win_probability", o.base_win_probability),
            ("odds.loyalty_boost", o.loyalty_boost),
            ("odds.max_win_probability", o.max_win_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LedgerError::config(field, value, "probability must be within 0..=1"));
            }
        }
        if o.loyalty_window_hours == 0 {
            return Err(LedgerError::config("odds.loyalty_window_hours", 0, "window cannot be empty"));
        }

        if self.retention.big_win_threshold.is_negative() {
            return Err(LedgerError::config(
                "retention.big_win_threshold",
                self.retention.big_win_threshold,
                "cannot be negative",
            ));
        }

        Ok(())
    }
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> LedgerResult<AppConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;

        if let Some(ref path) = config.runtime_config_path {
            match load_runtime_file(path) {
                Ok(runtime) => config.runtime = runtime,
                Err(e @ LedgerError::ConfigurationMissing(_)) => {
                    tracing::warn!(error = %e, "Runtime config file missing, keeping defaults");
                }
                Err(e) => return Err(e),
            }
        }

        validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> LedgerResult<AppConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::config("config_path", path, &format!("failed to read: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| LedgerError::config("config_path", path, &format!("failed to parse TOML: {}", e)))
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) -> LedgerResult<()> {
        if let Ok(dir) = env::var("CASINO_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(path) = env::var("CASINO_RUNTIME_CONFIG") {
            config.runtime_config_path = Some(path);
        }
        if let Ok(value) = env::var("CASINO_TICK_INTERVAL_SECS") {
            config.lottery.tick_interval_secs = value
                .parse()
                .map_err(|_| LedgerError::config("CASINO_TICK_INTERVAL_SECS", &value, "invalid number of seconds"))?;
        }
        if let Ok(value) = env::var("CASINO_MARGIN_PERCENT") {
            config.runtime.profit.margin_percent = value
                .parse()
                .map_err(|_| LedgerError::config("CASINO_MARGIN_PERCENT", &value, "invalid percentage"))?;
        }
        if let Ok(value) = env::var("CASINO_MAX_ATTEMPTS") {
            config.coordinator.max_attempts = value
                .parse()
                .map_err(|_| LedgerError::config("CASINO_MAX_ATTEMPTS", &value, "invalid attempt count"))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig, path: &str) -> LedgerResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| LedgerError::config("config", path, &format!("failed to serialize: {}", e)))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration values
pub fn validate(config: &AppConfig) -> LedgerResult<()> {
    if config.storage.data_directory.is_empty() {
        return Err(LedgerError::config("storage.data_directory", "", "cannot be empty"));
    }
    if config.storage.lock_timeout_ms <= 0 {
        return Err(LedgerError::config(
            "storage.lock_timeout_ms",
            config.storage.lock_timeout_ms,
            "must be positive",
        ));
    }
    if config.coordinator.max_attempts == 0 {
        return Err(LedgerError::config("coordinator.max_attempts", 0, "at least one attempt is required"));
    }
    if config.settlement.round_lock_ttl_ms == 0 {
        return Err(LedgerError::config("settlement.round_lock_ttl_ms", 0, "lock TTL cannot be zero"));
    }
    if config.settlement.min_bet > config.settlement.max_bet || !config.settlement.min_bet.is_positive() {
        return Err(LedgerError::config(
            "settlement.min_bet",
            config.settlement.min_bet,
            "must be positive and not above max_bet",
        ));
    }
    if config.lottery.tick_interval_secs == 0 {
        return Err(LedgerError::config("lottery.tick_interval_secs", 0, "tick interval cannot be zero"));
    }
    if config.lottery.max_tickets_per_purchase == 0 {
        return Err(LedgerError::config("lottery.max_tickets_per_purchase", 0, "cannot be zero"));
    }
    for template in &config.lottery.templates {
        if !template.ticket_price.is_positive() || template.duration_secs == 0 || template.prizes.is_empty() {
            return Err(LedgerError::config(
                "lottery.templates",
                &template.tier,
                "template needs a positive price, a duration and at least one prize",
            ));
        }
    }
    config.runtime.validate()
}

/// Read a runtime config file. A missing file is reported as
/// `ConfigurationMissing` so callers can fall back to defaults.
pub fn load_runtime_file<P: AsRef<Path>>(path: P) -> LedgerResult<RuntimeConfig> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LedgerError::ConfigurationMissing(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let runtime: RuntimeConfig = toml::from_str(&content).map_err(|e| {
        LedgerError::config("runtime_config_path", path.display(), &format!("failed to parse TOML: {}", e))
    })?;
    runtime.validate()?;
    Ok(runtime)
}

/// Shared, swappable [`RuntimeConfig`]
#[derive(Clone)]
pub struct RuntimeConfigHandle {
    current: Arc<RwLock<Arc<RuntimeConfig>>>,
}

impl RuntimeConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot used for one evaluation; later reloads do not affect it.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new config after validating it. The old one stays on error.
    pub fn replace(&self, config: RuntimeConfig) -> LedgerResult<()> {
        config.validate()?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(config);
        Ok(())
    }

    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> LedgerResult<()> {
        let runtime = load_runtime_file(path.as_ref())?;
        self.replace(runtime)?;
        tracing::info!(path = %path.as_ref().display(), "Runtime config reloaded");
        Ok(())
    }

    /// Follow `path` for changes. The returned watcher must be kept alive.
    pub fn watch<P: AsRef<Path>>(&self, path: P) -> LedgerResult<RecommendedWatcher> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let handle = self.clone();
        let watched = path.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                if let Err(e) = handle.reload_from_file(&watched) {
                    tracing::warn!(error = %e, "Ignoring invalid runtime config update");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Runtime config watcher error"),
        })
        .map_err(|e| LedgerError::config("runtime_config_path", path.display(), &e.to_string()))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| LedgerError::config("runtime_config_path", path.display(), &e.to_string()))?;

        Ok(watcher)
    }
}

/// Builder pattern for creating configurations
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn data_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.storage.data_directory = path.as_ref().to_string_lossy().to_string();
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.config.coordinator = coordinator;
        self
    }

    pub fn settlement(mut self, settlement: SettlementConfig) -> Self {
        self.config.settlement = settlement;
        self
    }

    pub fn lottery(mut self, lottery: LotteryConfig) -> Self {
        self.config.lottery = lottery;
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.config.runtime = runtime;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.coordinator.max_attempts, 3);
        assert_eq!(config.runtime.profit.margin_percent, 30.0);
        assert_eq!(config.lottery.reveal_delay_secs, 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.coordinator.max_attempts = 0;
        assert!(validate(&config).is_err());

        let mut runtime = RuntimeConfig::default();
        runtime.profit.margin_percent = 97.0;
        assert!(runtime.validate().is_err());

        runtime = RuntimeConfig::default();
        runtime.odds.max_win_probability = 1.5;
        assert!(runtime.validate().is_err());
    }

    #[test]
    fn test_save_and_load_config() -> LedgerResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let original = ConfigBuilder::new().data_directory("/tmp/ledger-test").build();
        let loader = ConfigLoader::new();
        loader.save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load()?;
        assert_eq!(loaded.storage.data_directory, "/tmp/ledger-test");
        assert_eq!(loaded.lottery.templates.len(), original.lottery.templates.len());
        Ok(())
    }

    #[test]
    fn test_partial_runtime_file_uses_defaults() -> LedgerResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "[profit]\nmargin_percent = 40.0\n")?;

        let runtime = load_runtime_file(&path)?;
        assert_eq!(runtime.profit.margin_percent, 40.0);
        assert_eq!(runtime.profit.vault_tax_percent, 5.0);
        assert_eq!(runtime.retention.lock_multiplier, 20);
        Ok(())
    }

    #[test]
    fn test_missing_runtime_file_is_configuration_missing() {
        let err = load_runtime_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, LedgerError::ConfigurationMissing(_)));
    }

    #[test]
    fn test_handle_snapshot_isolated_from_reload() {
        let handle = RuntimeConfigHandle::new(RuntimeConfig::default());
        let before = handle.snapshot();

        let mut updated = RuntimeConfig::default();
        updated.profit.margin_percent = 10.0;
        handle.replace(updated).unwrap();

        assert_eq!(before.profit.margin_percent, 30.0);
        assert_eq!(handle.snapshot().profit.margin_percent, 10.0);
    }

    #[test]
    fn test_handle_rejects_invalid_update() {
        let handle = RuntimeConfigHandle::new(RuntimeConfig::default());
        let mut bad = RuntimeConfig::default();
        bad.profit.window_hours = 0;

        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().profit.window_hours, 24);
    }
}
