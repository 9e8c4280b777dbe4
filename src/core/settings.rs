//! Manager-wide settings, layered from defaults, an optional JSON file and
//! `XRAY_MANAGER_*` environment variables.

use crate::constants;
use crate::core::genconfig::InboundProfile;
use crate::core::logs;
use anyhow::{Context, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Root for the registry document and per-proxy engine configs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where the engine binary and its data files are installed.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Download cache, keyed by version and asset name.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Download the engine automatically when it is missing.
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Optional mirror prefix substituted for https://github.com in asset
    /// download URLs. Release metadata always uses the canonical API.
    #[serde(default)]
    pub download_mirror: Option<String>,

    #[serde(default)]
    pub inbound_profile: InboundProfile,

    /// Policy default for TLS certificate checking when a descriptor does
    /// not say. Shipping default is false; changing it is a deliberate,
    /// visible decision.
    #[serde(default)]
    pub allow_insecure_default: bool,

    /// How long a freshly spawned engine must stay alive before the start
    /// is considered successful.
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,

    /// How long to wait for a graceful exit before force-killing.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Pause between stop and start on restart, letting the OS release the
    /// listening port.
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,

    #[serde(default = "default_per_proxy_log_cap")]
    pub per_proxy_log_cap: usize,

    #[serde(default = "default_global_log_cap")]
    pub global_log_cap: usize,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", constants::APP_NAME)
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".").join("data"))
}

fn default_install_dir() -> PathBuf {
    default_data_dir().join("engine")
}

fn default_cache_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".").join("cache"))
}

fn default_true() -> bool {
    true
}

fn default_start_grace_ms() -> u64 {
    1500
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_restart_pause_ms() -> u64 {
    300
}

fn default_per_proxy_log_cap() -> usize {
    logs::DEFAULT_PER_PROXY_CAP
}

fn default_global_log_cap() -> usize {
    logs::DEFAULT_GLOBAL_CAP
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            install_dir: default_install_dir(),
            cache_dir: default_cache_dir(),
            auto_download: true,
            download_mirror: None,
            inbound_profile: InboundProfile::default(),
            allow_insecure_default: false,
            start_grace_ms: default_start_grace_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            restart_pause_ms: default_restart_pause_ms(),
            per_proxy_log_cap: default_per_proxy_log_cap(),
            global_log_cap: default_global_log_cap(),
        }
    }
}

impl ManagerSettings {
    /// Layer defaults, an optional settings file and environment variables.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(
            &ManagerSettings::default(),
        )?);

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).required(false),
            );
        }

        let settings: ManagerSettings = builder
            .add_source(config::Environment::with_prefix("XRAY_MANAGER"))
            .build()
            .context("Failed to assemble settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.start_grace_ms >= 100,
            "Start grace period must be at least 100ms, got: {}",
            self.start_grace_ms
        );
        ensure!(
            self.stop_timeout_ms >= 500,
            "Stop timeout must be at least 500ms, got: {}",
            self.stop_timeout_ms
        );
        ensure!(
            self.per_proxy_log_cap >= 1 && self.global_log_cap >= self.per_proxy_log_cap,
            "Log caps must satisfy 1 <= per_proxy ({}) <= global ({})",
            self.per_proxy_log_cap,
            self.global_log_cap
        );
        if let Some(ref mirror) = self.download_mirror {
            ensure!(
                mirror.starts_with("http://") || mirror.starts_with("https://"),
                "Download mirror must be an http(s) URL, got: {}",
                mirror
            );
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("proxies.json")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.data_dir.join("configs")
    }

    pub fn version_record_path(&self) -> PathBuf {
        self.install_dir.join("version.json")
    }
}
