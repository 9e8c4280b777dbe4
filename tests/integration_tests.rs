use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use xray_manager::core::acquire::{BinaryAcquirer, DownloadProgress, ReleaseInfo};
use xray_manager::core::events::EventBus;
use xray_manager::core::logs::LogAggregator;
use xray_manager::core::registry::ProxyRegistry;
use xray_manager::core::settings::ManagerSettings;
use xray_manager::core::supervisor::{EngineSupervisor, SupervisorTimings};
use xray_manager::core::types::{Protocol, ProxyDescriptor, ProxyStatus};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "xray_manager_it_{}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst),
        label
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_settings(base: &PathBuf) -> Arc<ManagerSettings> {
    Arc::new(ManagerSettings {
        data_dir: base.clone(),
        install_dir: base.join("engine"),
        cache_dir: base.join("cache"),
        auto_download: false,
        start_grace_ms: 250,
        stop_timeout_ms: 2000,
        restart_pause_ms: 50,
        ..Default::default()
    })
}

fn descriptor(name: &str) -> ProxyDescriptor {
    ProxyDescriptor {
        name: name.to_string(),
        address: "example.com".to_string(),
        port: 443,
        local_port: 1080,
        protocol: Protocol::Vless,
        user_id: Some("550e8400-e29b-41d4-a716-446655440000".to_string()),
        password: None,
        stream_settings: None,
        config_path: None,
        status: ProxyStatus::Stopped,
        created_at: None,
        updated_at: None,
        last_started: None,
        last_stopped: None,
        live: None,
    }
}

mod cached_install {
    use super::*;
    use std::io::Write;
    use xray_manager::core::acquire::{Architecture, Platform, asset_name};

    /// Build a release archive holding the engine executable and both data
    /// files, the way the published zips are laid out.
    fn build_archive(dest: &PathBuf) {
        let file = std::fs::File::create(dest).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options: zip::write::SimpleFileOptions = Default::default();

        let binary_name = if cfg!(windows) { "xray.exe" } else { "xray" };
        zip.start_file(binary_name, options).unwrap();
        zip.write_all(b"#!/bin/sh\necho 'Xray 1.2.3 (test build)'\n")
            .unwrap();

        for data_file in ["geoip.dat", "geosite.dat"] {
            zip.start_file(data_file, options).unwrap();
            zip.write_all(b"data").unwrap();
        }

        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn cache_hit_installs_without_network_and_reports_full_progress() {
        let base = scratch_dir("cache_hit");
        let settings = test_settings(&base);
        let acquirer = BinaryAcquirer::new(&settings, EventBus::new()).unwrap();

        let asset = asset_name(Platform::detect().unwrap(), Architecture::detect().unwrap());
        std::fs::create_dir_all(&settings.cache_dir).unwrap();
        build_archive(&settings.cache_dir.join(format!("1.2.3-{asset}")));

        let release = ReleaseInfo {
            version: "1.2.3".to_string(),
            // No assets: resolving a download URL would need the network,
            // which the cache hit must never touch.
            assets: Vec::new(),
        };

        let seen: Arc<std::sync::Mutex<Vec<Option<u8>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_callback = seen.clone();
        let progress: xray_manager::core::acquire::ProgressCallback =
            Arc::new(move |p: DownloadProgress| {
                seen_for_callback.lock().unwrap().push(p.percentage());
            });

        let installed = acquirer
            .install_release(&release, Some(progress))
            .await
            .unwrap();

        assert!(installed.exists());
        assert!(settings.install_dir.join("geoip.dat").exists());
        assert!(settings.install_dir.join("geosite.dat").exists());
        assert!(settings.version_record_path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "engine must be executable");
        }

        let reported = seen.lock().unwrap();
        assert_eq!(
            reported.last().copied().flatten(),
            Some(100),
            "progress must reach 100% even on the cache path"
        );

        let record: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(settings.version_record_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(record["version"], "1.2.3");
    }

    #[tokio::test]
    async fn incomplete_archive_is_a_fatal_install_error() {
        let base = scratch_dir("incomplete");
        let settings = test_settings(&base);
        let acquirer = BinaryAcquirer::new(&settings, EventBus::new()).unwrap();

        let asset = asset_name(Platform::detect().unwrap(), Architecture::detect().unwrap());
        std::fs::create_dir_all(&settings.cache_dir).unwrap();

        // Archive with the binary but no data files.
        let archive_path = settings.cache_dir.join(format!("2.0.0-{asset}"));
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options: zip::write::SimpleFileOptions = Default::default();
        let binary_name = if cfg!(windows) { "xray.exe" } else { "xray" };
        zip.start_file(binary_name, options).unwrap();
        zip.write_all(b"binary").unwrap();
        zip.finish().unwrap();

        let release = ReleaseInfo {
            version: "2.0.0".to_string(),
            assets: Vec::new(),
        };

        match acquirer.install_release(&release, None).await {
            Err(xray_manager::errors::AcquireError::InstallIncomplete { missing }) => {
                assert!(missing.contains(&"geoip.dat".to_string()));
                assert!(missing.contains(&"geosite.dat".to_string()));
            }
            other => panic!("expected InstallIncomplete, got {other:?}"),
        }
        assert!(
            !settings.version_record_path().exists(),
            "a failed install must not record a version"
        );
    }
}

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_engine(dir: &PathBuf) -> PathBuf {
        let path = dir.join("fake-engine");
        std::fs::write(&path, "#!/bin/sh\necho '[Info] engine up'\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    async fn registry_with_fake_engine(base: &PathBuf) -> (ProxyRegistry, Arc<LogAggregator>) {
        let settings = test_settings(base);
        let events = EventBus::new();
        let logs = Arc::new(LogAggregator::new(
            settings.per_proxy_log_cap,
            settings.global_log_cap,
            events.clone(),
        ));
        let supervisor = Arc::new(EngineSupervisor::new(
            Some(fake_engine(base)),
            logs.clone(),
            SupervisorTimings {
                start_grace: Duration::from_millis(settings.start_grace_ms),
                stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
                restart_pause: Duration::from_millis(settings.restart_pause_ms),
            },
        ));
        let acquirer = Arc::new(BinaryAcquirer::new(&settings, events.clone()).unwrap());

        let registry = ProxyRegistry::load(settings, supervisor, acquirer, events)
            .await
            .unwrap();
        (registry, logs)
    }

    #[tokio::test]
    async fn add_start_list_stop_scenario() {
        let base = scratch_dir("scenario");
        let (registry, logs) = registry_with_fake_engine(&base).await;

        registry.add(descriptor("mc1")).await.unwrap();
        registry.start("mc1").await.unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "mc1");
        assert_eq!(listed[0].status, ProxyStatus::Running);
        let live = listed[0].live.unwrap();
        assert!(live.pid.is_some());
        assert!(live.uptime.is_some());

        let stats = registry.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.stopped, 0);

        // Give the monitor task a beat to pick up the engine's first line.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let page = logs.get_logs(&xray_manager::core::logs::LogFilter {
            proxy_name: Some("mc1".to_string()),
            ..Default::default()
        });
        assert!(page.total >= 1);
        assert!(page.logs.iter().any(|e| e.message.contains("engine up")));

        registry.stop("mc1").await.unwrap();

        let listed = registry.list();
        assert_eq!(listed[0].status, ProxyStatus::Stopped);
        let detail = registry.get("mc1").unwrap();
        assert!(detail.last_started.is_some());
        assert!(detail.last_stopped.is_some());
    }

    #[tokio::test]
    async fn double_start_leaves_exactly_one_process() {
        let base = scratch_dir("double_start");
        let (registry, _logs) = registry_with_fake_engine(&base).await;
        let registry = Arc::new(registry);

        registry.add(descriptor("mc1")).await.unwrap();

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start("mc1").await })
        };
        let second = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start("mc1").await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok_count, 1, "exactly one start must win: {results:?}");

        assert_eq!(registry.stats().running, 1);
        registry.stop("mc1").await.unwrap();
    }

    #[tokio::test]
    async fn update_of_running_proxy_restarts_with_new_config() {
        let base = scratch_dir("update_running");
        let (registry, _logs) = registry_with_fake_engine(&base).await;

        registry.add(descriptor("mc1")).await.unwrap();
        registry.start("mc1").await.unwrap();
        let pid_before = registry.get("mc1").unwrap().live.unwrap().pid;

        let mut changed = descriptor("mc1");
        changed.local_port = 2080;
        registry.update("mc1", changed).await.unwrap();

        let detail = registry.get("mc1").unwrap();
        assert_eq!(detail.status, ProxyStatus::Running);
        assert_ne!(detail.live.unwrap().pid, pid_before);
        assert_eq!(detail.local_port, 2080);

        let config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(detail.config_path.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(config["inbounds"][0]["port"], 2080);

        registry.stop("mc1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_reports_per_proxy() {
        let base = scratch_dir("stop_all");
        let (registry, _logs) = registry_with_fake_engine(&base).await;

        let mut a = descriptor("a");
        a.local_port = 1081;
        let mut b = descriptor("b");
        b.local_port = 1082;
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        registry.start("a").await.unwrap();
        registry.start("b").await.unwrap();
        assert_eq!(registry.stats().running, 2);

        let outcomes = registry.stop_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.ok));
        assert_eq!(registry.stats().running, 0);
    }

    #[tokio::test]
    async fn delete_of_running_proxy_stops_it_first() {
        let base = scratch_dir("delete_running");
        let (registry, _logs) = registry_with_fake_engine(&base).await;

        registry.add(descriptor("mc1")).await.unwrap();
        registry.start("mc1").await.unwrap();

        registry.delete("mc1").await.unwrap();
        assert!(registry.get("mc1").is_none());
        assert_eq!(registry.stats().total, 0);
    }
}
