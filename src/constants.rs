use std::path::PathBuf;

pub const APP_NAME: &str = "xray-manager";

/// GitHub coordinates of the engine release source. Release metadata always
/// comes from the canonical API; only asset downloads honor a mirror.
pub const ENGINE_REPO_OWNER: &str = "XTLS";
pub const ENGINE_REPO_NAME: &str = "Xray-core";

/// Data files the engine requires next to the executable. An install that is
/// missing either of these is incomplete.
pub const ENGINE_DATA_FILES: [&str; 2] = ["geoip.dat", "geosite.dat"];

pub fn engine_binary_name() -> &'static str {
    if cfg!(windows) { "xray.exe" } else { "xray" }
}

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}
