//! `casewatch.toml`: the file layer between built-in defaults and CLI flags.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::BrokerKind;
use crate::error::ConfigError;
use crate::monitor::{DispatchFailurePolicy, MonitorSettings};
use crate::snapshot::WalkOpts;
use crate::worker::{PoolSpec, WorkerSettings, default_pool_table, normalize_pool_table};

use super::config::{PackagePaths, PoolConsts, WatchConsts, WorkerConsts};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SettingsToml {
    #[serde(default)]
    settings: SettingsSection,
    pools: Option<Vec<PoolSpec>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsSection {
    catalog_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    scan_interval: Option<f64>,
    cooldown: Option<f64>,
    claim_poll: Option<f64>,
    settle_interval: Option<f64>,
    settle_retry_interval: Option<f64>,
    parallel_walk: Option<bool>,
    follow_links: Option<bool>,
    on_dispatch_failure: Option<DispatchFailurePolicy>,
    standalone: Option<bool>,
    windows_cores: Option<usize>,
    broker: Option<BrokerKind>,
}

/// Everything a run is configured with, after defaults, file and CLI are layered.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub catalog_dir: PathBuf,
    pub store_path: PathBuf,
    pub scan_interval: Duration,
    pub cooldown: Duration,
    pub claim_poll: Duration,
    pub settle_interval: Duration,
    pub settle_retry_interval: Duration,
    pub parallel_walk: bool,
    pub follow_links: bool,
    pub on_dispatch_failure: DispatchFailurePolicy,
    /// Agent runs next to the shared storage (enables the disk-only pools).
    pub standalone: bool,
    pub windows_cores: usize,
    pub broker: BrokerKind,
    /// Replaces the default pool table when set.
    pub pools: Option<Vec<PoolSpec>>,
    pub agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from(WatchConsts::CATALOG_DIR),
            store_path: PathBuf::from(PackagePaths::get().store_filename()),
            scan_interval: WatchConsts::SCAN_INTERVAL,
            cooldown: WatchConsts::COOLDOWN,
            claim_poll: WorkerConsts::CLAIM_POLL,
            settle_interval: WorkerConsts::SETTLE_INTERVAL,
            settle_retry_interval: WorkerConsts::SETTLE_RETRY_INTERVAL,
            parallel_walk: false,
            follow_links: false,
            on_dispatch_failure: DispatchFailurePolicy::default(),
            standalone: true,
            windows_cores: PoolConsts::WINDOWS_CORES,
            broker: BrokerKind::default(),
            pools: None,
            agent: String::new(),
        }
    }
}

impl AppConfig {
    pub fn monitor_settings(&self, reprocess: bool) -> MonitorSettings {
        MonitorSettings {
            scan_interval: self.scan_interval,
            cooldown: self.cooldown,
            reprocess,
            walk: WalkOpts {
                parallel_walk: self.parallel_walk,
                follow_links: self.follow_links,
            },
            on_dispatch_failure: self.on_dispatch_failure,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            claim_poll: self.claim_poll,
            settle_interval: self.settle_interval,
            settle_retry_interval: self.settle_retry_interval,
            agent: self.agent.clone(),
        }
    }

    /// Configured pool table, or the default one for this host.
    pub fn pool_table(&self) -> Vec<PoolSpec> {
        match &self.pools {
            Some(p) => normalize_pool_table(p),
            None => default_pool_table(self.standalone, self.windows_cores),
        }
    }
}

/// Load `path` if it exists. A missing file is not an error; a malformed one is.
pub(crate) fn load_settings_toml(path: &Path) -> Result<Option<SettingsToml>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Overwrite a config field from the file when present.
macro_rules! apply_file_opt {
    ($sec:expr, $cfg:expr, $sec_field:ident => $cfg_field:ident as secs) => {
        if let Some(v) = $sec.$sec_field {
            $cfg.$cfg_field = secs(stringify!($sec_field), v)?;
        }
    };
    ($sec:expr, $cfg:expr, $sec_field:ident => $cfg_field:ident) => {
        if let Some(v) = $sec.$sec_field.clone() {
            $cfg.$cfg_field = v;
        }
    };
}

fn secs(field: &str, v: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(v)
        .map_err(|_| ConfigError::Invalid(format!("{} must be a non-negative number of seconds", field)))
}

/// Apply file values to `cfg` (only fields present in the file). Relative paths are
/// resolved against `base_dir`, the directory holding the file.
pub(crate) fn apply_settings_toml(
    file: &SettingsToml,
    base_dir: &Path,
    cfg: &mut AppConfig,
) -> Result<(), ConfigError> {
    let sec = &file.settings;
    if let Some(p) = &sec.catalog_dir {
        cfg.catalog_dir = base_dir.join(p);
    }
    if let Some(p) = &sec.store_path {
        cfg.store_path = base_dir.join(p);
    }
    apply_file_opt!(sec, cfg, scan_interval => scan_interval as secs);
    apply_file_opt!(sec, cfg, cooldown => cooldown as secs);
    apply_file_opt!(sec, cfg, claim_poll => claim_poll as secs);
    apply_file_opt!(sec, cfg, settle_interval => settle_interval as secs);
    apply_file_opt!(sec, cfg, settle_retry_interval => settle_retry_interval as secs);
    apply_file_opt!(sec, cfg, parallel_walk => parallel_walk);
    apply_file_opt!(sec, cfg, follow_links => follow_links);
    apply_file_opt!(sec, cfg, on_dispatch_failure => on_dispatch_failure);
    apply_file_opt!(sec, cfg, standalone => standalone);
    apply_file_opt!(sec, cfg, windows_cores => windows_cores);
    apply_file_opt!(sec, cfg, broker => broker);
    if let Some(pools) = &file.pools {
        if pools.is_empty() {
            return Err(ConfigError::Invalid("[[pools]] is present but empty".to_string()));
        }
        cfg.pools = Some(pools.clone());
    }
    Ok(())
}

/// Defaults overlaid with `config_path` (if it exists).
pub fn load_app_config(config_path: &Path) -> Result<AppConfig, ConfigError> {
    let mut cfg = AppConfig::default();
    if let Some(file) = load_settings_toml(config_path)? {
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        apply_settings_toml(&file, base, &mut cfg)?;
        log::debug!("config loaded from {}", config_path.display());
    }
    Ok(cfg)
}
