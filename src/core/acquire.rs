//! Engine binary acquisition: resolve the platform asset, query the release
//! API, download through an optional mirror with a local cache, extract,
//! verify, and record the installed version.
//!
//! Network failures are retried with bounded backoff. Extraction and
//! post-install verification failures are terminal for the attempt and
//! surfaced to the caller.

use crate::constants::{self, ENGINE_DATA_FILES, ENGINE_REPO_NAME, ENGINE_REPO_OWNER};
use crate::core::events::{AcquisitionEvent, EventBus, ManagerEvent};
use crate::core::settings::ManagerSettings;
use crate::core::store;
use crate::errors::AcquireError;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const MAX_FETCH_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 500;

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percentage(&self) -> Option<u8> {
        self.total.map(|t| {
            if t == 0 {
                100
            } else {
                ((self.downloaded as f64 / t as f64) * 100.0).min(100.0) as u8
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    pub fn detect() -> Result<Self, AcquireError> {
        if cfg!(target_os = "windows") {
            Ok(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Ok(Platform::Macos)
        } else if cfg!(target_os = "linux") {
            Ok(Platform::Linux)
        } else {
            Err(AcquireError::UnsupportedPlatform)
        }
    }

    fn asset_token(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.asset_token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    X64,
    Arm32,
    Arm64,
}

impl Architecture {
    pub fn detect() -> Result<Self, AcquireError> {
        if cfg!(target_arch = "x86_64") {
            Ok(Architecture::X64)
        } else if cfg!(target_arch = "x86") {
            Ok(Architecture::X86)
        } else if cfg!(target_arch = "aarch64") {
            Ok(Architecture::Arm64)
        } else if cfg!(target_arch = "arm") {
            Ok(Architecture::Arm32)
        } else {
            Err(AcquireError::UnsupportedPlatform)
        }
    }

    /// Token used in the release asset naming scheme.
    fn asset_token(&self) -> &'static str {
        match self {
            Architecture::X86 => "32",
            Architecture::X64 => "64",
            Architecture::Arm32 => "arm32-v7a",
            Architecture::Arm64 => "arm64-v8a",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.asset_token())
    }
}

pub fn asset_name(platform: Platform, architecture: Architecture) -> String {
    format!(
        "Xray-{}-{}.zip",
        platform.asset_token(),
        architecture.asset_token()
    )
}

/// Numeric dot-separated version comparison, field by field; missing
/// trailing components are treated as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.trim_start_matches('v')
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };

    let left = parse(a);
    let right = parse(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    pub prerelease: bool,
    pub draft: bool,
    pub assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub version: String,
    pub assets: Vec<GitHubAsset>,
}

impl ReleaseInfo {
    /// Download URL for an asset, synthesized from the canonical release
    /// layout when the metadata fetch did not include assets (the
    /// rate-limit fallback path).
    pub fn download_url_for(&self, asset: &str) -> String {
        self.assets
            .iter()
            .find(|a| a.name == asset)
            .map(|a| a.browser_download_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "https://github.com/{}/{}/releases/download/v{}/{}",
                    ENGINE_REPO_OWNER, ENGINE_REPO_NAME, self.version, asset
                )
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledVersionRecord {
    pub version: String,
    pub download_url: String,
    pub download_date: DateTime<Utc>,
    pub platform: String,
    pub architecture: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    NotInstalled,
    Outdated,
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateReason::NotInstalled => write!(f, "not_installed"),
            UpdateReason::Outdated => write!(f, "outdated"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheck {
    pub needs_update: bool,
    pub reason: Option<UpdateReason>,
    pub current_version: Option<String>,
    pub latest_version: String,
}

pub struct BinaryAcquirer {
    client: reqwest::Client,
    install_dir: PathBuf,
    cache_dir: PathBuf,
    version_record_path: PathBuf,
    mirror: Option<String>,
    events: EventBus,
}

impl BinaryAcquirer {
    pub fn new(settings: &ManagerSettings, events: EventBus) -> Result<Self, AcquireError> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{}",
                constants::APP_NAME,
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(|e| AcquireError::Network(e.to_string()))?;

        Ok(Self {
            client,
            install_dir: settings.install_dir.clone(),
            cache_dir: settings.cache_dir.clone(),
            version_record_path: settings.version_record_path(),
            mirror: settings.download_mirror.clone(),
            events,
        })
    }

    pub fn executable_path(&self) -> PathBuf {
        self.install_dir.join(constants::engine_binary_name())
    }

    /// Resolve a usable installed engine: the executable plus both data
    /// files in the install dir, confirmed runnable by its version probe.
    /// Falls back to the process search path.
    pub async fn check_installed(&self) -> Option<PathBuf> {
        let exe = self.executable_path();
        if exe.exists() && is_executable(&exe) && self.missing_artifacts().is_empty() {
            if probe_version(&exe).await.is_some() {
                return Some(exe);
            }
            tracing::warn!(
                "Engine binary at {} does not answer its version probe",
                exe.display()
            );
        }

        find_in_path(constants::engine_binary_name())
    }

    pub async fn installed_record(&self) -> Option<InstalledVersionRecord> {
        let contents = tokio::fs::read_to_string(&self.version_record_path)
            .await
            .ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// The locally recorded version, falling back to asking the binary.
    pub async fn installed_version(&self) -> Option<String> {
        if let Some(record) = self.installed_record().await {
            return Some(record.version);
        }
        probe_version(&self.executable_path()).await
    }

    /// Latest release metadata from the canonical API, with bounded retries
    /// and a redirect-based fallback when the API is rate limited.
    pub async fn get_latest_release(&self) -> Result<ReleaseInfo, AcquireError> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/releases/latest",
            ENGINE_REPO_OWNER, ENGINE_REPO_NAME
        );

        let mut last_error = AcquireError::Network("release lookup failed".to_string());

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let response = match self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Release API request failed (attempt {}): {}", attempt + 1, e);
                    last_error = AcquireError::Network(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::FORBIDDEN
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                tracing::warn!("Release API rate limited, resolving version via redirect");
                return self.latest_release_via_redirect().await;
            }
            if !status.is_success() {
                last_error = AcquireError::Network(format!("HTTP {} from release API", status));
                continue;
            }

            match response.json::<GitHubRelease>().await {
                Ok(release) => {
                    let version = release.tag_name.trim_start_matches('v').to_string();
                    return Ok(ReleaseInfo {
                        version,
                        assets: release.assets,
                    });
                }
                Err(e) => {
                    last_error = AcquireError::Network(e.to_string());
                }
            }
        }

        Err(last_error)
    }

    /// Rate-limit fallback: the release page's `releases/latest` redirect
    /// carries the version tag in its Location header.
    async fn latest_release_via_redirect(&self) -> Result<ReleaseInfo, AcquireError> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{}",
                constants::APP_NAME,
                env!("CARGO_PKG_VERSION")
            ))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AcquireError::Network(e.to_string()))?;

        let url = format!(
            "https://github.com/{}/{}/releases/latest",
            ENGINE_REPO_OWNER, ENGINE_REPO_NAME
        );

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| AcquireError::Network(e.to_string()))?;

        let version = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| location.rsplit('/').next())
            .map(|tag| tag.trim_start_matches('v').to_string())
            .filter(|version| !version.is_empty());

        match version {
            Some(version) => Ok(ReleaseInfo {
                version,
                assets: Vec::new(),
            }),
            None => Err(AcquireError::RateLimited),
        }
    }

    pub async fn check_for_updates(&self) -> Result<UpdateCheck, AcquireError> {
        let latest = self.get_latest_release().await?;

        match self.installed_version().await {
            None => Ok(UpdateCheck {
                needs_update: true,
                reason: Some(UpdateReason::NotInstalled),
                current_version: None,
                latest_version: latest.version,
            }),
            Some(current) => {
                let outdated = compare_versions(&current, &latest.version) == Ordering::Less;
                Ok(UpdateCheck {
                    needs_update: outdated,
                    reason: outdated.then_some(UpdateReason::Outdated),
                    current_version: Some(current),
                    latest_version: latest.version,
                })
            }
        }
    }

    /// Download and install the latest release. `force` reinstalls even if
    /// the installed version already matches.
    pub async fn download_and_install(
        &self,
        progress: Option<ProgressCallback>,
        force: bool,
    ) -> Result<PathBuf, AcquireError> {
        self.events
            .emit(ManagerEvent::Acquisition(AcquisitionEvent::Initializing));

        let release = self.get_latest_release().await?;

        if !force
            && let Some(current) = self.installed_version().await
            && compare_versions(&current, &release.version) != Ordering::Less
            && let Some(path) = self.check_installed().await
        {
            tracing::info!("Engine {} already installed, skipping download", current);
            self.events.emit(ManagerEvent::Acquisition(AcquisitionEvent::Ready {
                path: path.clone(),
            }));
            return Ok(path);
        }

        self.install_release(&release, progress).await
    }

    /// Install one specific release: cache-or-download the archive, extract
    /// it, verify the executable and data files, and record the version.
    pub async fn install_release(
        &self,
        release: &ReleaseInfo,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, AcquireError> {
        let platform = Platform::detect()?;
        let architecture = Architecture::detect()?;
        let asset = asset_name(platform, architecture);

        tokio::fs::create_dir_all(&self.install_dir).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let cache_key = format!("{}-{}", release.version, asset);
        let cached_archive = self.cache_dir.join(&cache_key);
        let download_url = self.apply_mirror(release.download_url_for(&asset));

        if cached_archive.exists() {
            tracing::info!("Using cached archive {}", cached_archive.display());
            let size = tokio::fs::metadata(&cached_archive).await?.len();
            self.report_progress(
                &progress,
                DownloadProgress {
                    downloaded: size,
                    total: Some(size),
                },
            );
        } else {
            tracing::info!("Downloading {} from {}", asset, download_url);
            self.download_to(&download_url, &cached_archive, &progress)
                .await?;
        }

        self.extract_archive(&cached_archive)?;

        let missing = self.missing_artifacts();
        if !missing.is_empty() {
            return Err(AcquireError::InstallIncomplete { missing });
        }

        let record = InstalledVersionRecord {
            version: release.version.clone(),
            download_url,
            download_date: Utc::now(),
            platform: platform.to_string(),
            architecture: architecture.to_string(),
        };
        store::save(&self.version_record_path, &record)
            .await
            .map_err(|e| AcquireError::Io(std::io::Error::other(e.to_string())))?;

        let path = self.executable_path();
        tracing::info!(
            "Engine {} installed at {}",
            release.version,
            path.display()
        );
        self.events.emit(ManagerEvent::Acquisition(AcquisitionEvent::Ready {
            path: path.clone(),
        }));

        Ok(path)
    }

    /// Resolve a usable engine, downloading one when allowed.
    pub async fn ensure_available(
        &self,
        auto_download: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, AcquireError> {
        if let Some(path) = self.check_installed().await {
            self.events.emit(ManagerEvent::Acquisition(AcquisitionEvent::Ready {
                path: path.clone(),
            }));
            return Ok(path);
        }

        self.events.emit(ManagerEvent::Acquisition(
            AcquisitionEvent::DownloadRequired {
                reason: UpdateReason::NotInstalled.to_string(),
            },
        ));

        if !auto_download {
            return Err(AcquireError::NotInstalled);
        }

        match self.download_and_install(progress, false).await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.events.emit(ManagerEvent::Acquisition(
                    AcquisitionEvent::DownloadFailed {
                        error: e.to_string(),
                    },
                ));
                Err(e)
            }
        }
    }

    /// Remove cached archives older than the newest by modification time,
    /// optionally keeping exactly the newest.
    pub async fn clean_cache(&self, keep_latest: bool) -> Result<usize, AcquireError> {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(metadata) = entry.metadata().await
                && let Ok(modified) = metadata.modified()
            {
                entries.push((path, modified));
            }
        }

        let ordered: Vec<PathBuf> = entries
            .into_iter()
            .sorted_by_key(|(_, modified)| *modified)
            .rev()
            .map(|(path, _)| path)
            .collect();

        let skip = if keep_latest { 1 } else { 0 };
        let mut removed = 0;
        for path in ordered.into_iter().skip(skip) {
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {
                    tracing::info!("Removed cached archive {}", path.display());
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to remove cached archive {}: {}", path.display(), e);
                }
            }
        }

        Ok(removed)
    }

    fn apply_mirror(&self, url: String) -> String {
        match &self.mirror {
            Some(mirror) => match url.strip_prefix("https://github.com") {
                Some(rest) => format!("{}{}", mirror.trim_end_matches('/'), rest),
                None => url,
            },
            None => url,
        }
    }

    /// Streamed download to a temp file, renamed into the cache only once
    /// complete; progress is reported per chunk.
    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        progress: &Option<ProgressCallback>,
    ) -> Result<(), AcquireError> {
        let mut last_error = AcquireError::Network("download failed".to_string());

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            match self.try_download(url, dest, progress).await {
                Ok(()) => return Ok(()),
                Err(e @ AcquireError::AssetMissing(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Download attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        progress: &Option<ProgressCallback>,
    ) -> Result<(), AcquireError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AcquireError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AcquireError::AssetMissing(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(AcquireError::Network(format!(
                "HTTP {} downloading {}",
                response.status(),
                url
            )));
        }

        let total = response.content_length();
        let part_path = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_percent: Option<u8> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AcquireError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let snapshot = DownloadProgress { downloaded, total };
            let percent = snapshot.percentage();
            self.report_progress(progress, snapshot);

            if percent != last_percent {
                last_percent = percent;
                self.events.emit(ManagerEvent::Acquisition(
                    AcquisitionEvent::Downloading {
                        percent,
                        downloaded,
                        total,
                    },
                ));
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part_path, dest).await?;

        Ok(())
    }

    fn report_progress(&self, progress: &Option<ProgressCallback>, snapshot: DownloadProgress) {
        if let Some(callback) = progress {
            callback(snapshot);
        }
    }

    /// Flatten the archive into the install dir; entry paths are not
    /// trusted, only file names.
    fn extract_archive(&self, archive_path: &Path) -> Result<(), AcquireError> {
        let file = std::fs::File::open(archive_path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| AcquireError::Extraction(e.to_string()))?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| AcquireError::Extraction(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let Some(file_name) = Path::new(&name).file_name() else {
                continue;
            };

            let dest = self.install_dir.join(file_name);
            let mut out = std::fs::File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let exe = self.executable_path();
            if exe.exists() {
                let mut perms = std::fs::metadata(&exe)?.permissions();
                perms.set_mode(0o755);
                std::fs::set_permissions(&exe, perms)?;
            }
        }

        Ok(())
    }

    /// Install-dir artifacts the engine cannot run without that are absent.
    fn missing_artifacts(&self) -> Vec<String> {
        let mut missing = Vec::new();

        let exe = self.executable_path();
        if !exe.exists() {
            missing.push(constants::engine_binary_name().to_string());
        }

        for data_file in ENGINE_DATA_FILES {
            if !self.install_dir.join(data_file).exists() {
                missing.push(data_file.to_string());
            }
        }

        missing
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.saturating_sub(1)))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Ask the binary for its version; the first output line looks like
/// `Xray 25.1.1 (Xray, Penetrates Everything.)`.
async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::process::Command::new(path)
        .arg("version")
        .output()
        .await
        .ok()?;

    parse_version_line(&String::from_utf8_lossy(&output.stdout))
}

fn parse_version_line(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .filter(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn version_comparison() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0.0", "2.0.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("v1.3.0", "1.2.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
    }

    #[test]
    fn asset_names_follow_release_scheme() {
        assert_eq!(
            asset_name(Platform::Linux, Architecture::X64),
            "Xray-linux-64.zip"
        );
        assert_eq!(
            asset_name(Platform::Windows, Architecture::X86),
            "Xray-windows-32.zip"
        );
        assert_eq!(
            asset_name(Platform::Macos, Architecture::Arm64),
            "Xray-macos-arm64-v8a.zip"
        );
        assert_eq!(
            asset_name(Platform::Linux, Architecture::Arm32),
            "Xray-linux-arm32-v7a.zip"
        );
    }

    #[test]
    fn detect_resolves_on_supported_hosts() {
        // The test host is necessarily one of the supported combinations.
        assert!(Platform::detect().is_ok());
        assert!(Architecture::detect().is_ok());
    }

    #[test]
    fn download_url_prefers_release_asset() {
        let release = ReleaseInfo {
            version: "1.2.3".to_string(),
            assets: vec![GitHubAsset {
                name: "Xray-linux-64.zip".to_string(),
                browser_download_url: "https://example.com/direct.zip".to_string(),
                size: 1,
            }],
        };
        assert_eq!(
            release.download_url_for("Xray-linux-64.zip"),
            "https://example.com/direct.zip"
        );
        assert_eq!(
            release.download_url_for("Xray-windows-64.zip"),
            "https://github.com/XTLS/Xray-core/releases/download/v1.2.3/Xray-windows-64.zip"
        );
    }

    #[test]
    fn progress_percentage() {
        let p = DownloadProgress {
            downloaded: 50,
            total: Some(100),
        };
        assert_eq!(p.percentage(), Some(50));

        let p = DownloadProgress {
            downloaded: 10,
            total: None,
        };
        assert_eq!(p.percentage(), None);

        let p = DownloadProgress {
            downloaded: 0,
            total: Some(0),
        };
        assert_eq!(p.percentage(), Some(100));
    }

    #[test]
    fn version_line_parsing() {
        assert_eq!(
            parse_version_line("Xray 25.1.1 (Xray, Penetrates Everything.)"),
            Some("25.1.1".to_string())
        );
        assert_eq!(parse_version_line(""), None);
        assert_eq!(parse_version_line("usage: engine [flags]"), None);
    }

    #[test]
    fn retry_delays_double() {
        assert_eq!(retry_delay(1), Duration::from_millis(500));
        assert_eq!(retry_delay(2), Duration::from_millis(1000));
    }

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn acquirer_with_dirs() -> (BinaryAcquirer, PathBuf) {
        let base = std::env::temp_dir().join(format!(
            "xray_manager_acquire_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
        ));
        std::fs::create_dir_all(&base).unwrap();

        let settings = ManagerSettings {
            data_dir: base.clone(),
            install_dir: base.join("engine"),
            cache_dir: base.join("cache"),
            ..Default::default()
        };
        (
            BinaryAcquirer::new(&settings, EventBus::new()).unwrap(),
            base,
        )
    }

    #[test]
    fn mirror_rewrites_github_urls_only() {
        let (acquirer, _base) = acquirer_with_dirs();
        let mirrored = BinaryAcquirer {
            mirror: Some("https://mirror.example.com/".to_string()),
            ..acquirer
        };

        assert_eq!(
            mirrored.apply_mirror(
                "https://github.com/XTLS/Xray-core/releases/download/v1.0/x.zip".to_string()
            ),
            "https://mirror.example.com/XTLS/Xray-core/releases/download/v1.0/x.zip"
        );
        assert_eq!(
            mirrored.apply_mirror("https://cdn.example.com/x.zip".to_string()),
            "https://cdn.example.com/x.zip"
        );
    }

    #[tokio::test]
    async fn clean_cache_keeps_only_newest() {
        let (acquirer, _base) = acquirer_with_dirs();
        std::fs::create_dir_all(&acquirer.cache_dir).unwrap();

        let now = std::time::SystemTime::now();
        for (name, age_secs) in [("1.0.0-a.zip", 300u64), ("1.1.0-a.zip", 200), ("1.2.0-a.zip", 0)]
        {
            let path = acquirer.cache_dir.join(name);
            std::fs::write(&path, b"archive").unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(now - Duration::from_secs(age_secs)).unwrap();
        }

        let removed = acquirer.clean_cache(true).await.unwrap();
        assert_eq!(removed, 2);
        assert!(acquirer.cache_dir.join("1.2.0-a.zip").exists());
        assert!(!acquirer.cache_dir.join("1.0.0-a.zip").exists());

        let removed = acquirer.clean_cache(false).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn clean_cache_on_missing_dir_is_zero() {
        let (acquirer, _base) = acquirer_with_dirs();
        assert_eq!(acquirer.clean_cache(true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_artifacts_lists_everything_when_empty() {
        let (acquirer, _base) = acquirer_with_dirs();
        let missing = acquirer.missing_artifacts();
        assert_eq!(missing.len(), 3);
        assert!(missing.contains(&"geoip.dat".to_string()));
        assert!(missing.contains(&"geosite.dat".to_string()));
    }
}
