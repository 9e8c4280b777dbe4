// xray-manager
// Entry point for the headless manager

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use xray_manager::constants;
use xray_manager::core::events::{AcquisitionEvent, EventBus, ManagerEvent};
use xray_manager::core::genconfig::InboundProfile;
use xray_manager::core::logs::LogAggregator;
use xray_manager::core::registry::ProxyRegistry;
use xray_manager::core::settings::ManagerSettings;
use xray_manager::core::supervisor::{EngineSupervisor, SupervisorTimings};
use xray_manager::core::{acquire::BinaryAcquirer, types::ProxyStatus};

#[derive(Parser, Debug)]
#[command(name = "xray-manager")]
#[command(about = "Headless manager for Xray proxy engine instances")]
struct Args {
    #[arg(long, help = "Path to settings file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Path to the engine binary, skipping acquisition")]
    engine_path: Option<PathBuf>,

    #[arg(long, help = "Inbound profile: socks or forward")]
    profile: Option<String>,

    #[arg(long, help = "Never download the engine automatically")]
    no_download: bool,
}

fn setup_tracing() -> Result<()> {
    let log_directory = constants::default_log_directory();
    std::fs::create_dir_all(&log_directory).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(&log_directory, "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).json())
        .with(fmt::layer().pretty().with_writer(std::io::stdout))
        .init();

    std::mem::forget(_guard);

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing().context("Failed to initialize tracing")?;

    tracing::info!("xray-manager starting");

    let mut settings =
        ManagerSettings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(profile) = &args.profile {
        settings.inbound_profile = match profile.as_str() {
            "socks" => InboundProfile::Socks,
            "forward" => InboundProfile::Forward,
            other => anyhow::bail!("Unknown inbound profile: {}", other),
        };
    }
    if args.no_download {
        settings.auto_download = false;
    }
    let settings = Arc::new(settings);

    tracing::info!("Data directory: {}", settings.data_dir.display());
    tracing::info!("Install directory: {}", settings.install_dir.display());

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    let events = EventBus::new();
    let logs = Arc::new(LogAggregator::new(
        settings.per_proxy_log_cap,
        settings.global_log_cap,
        events.clone(),
    ));
    let supervisor = Arc::new(EngineSupervisor::new(
        args.engine_path.clone(),
        logs.clone(),
        SupervisorTimings {
            start_grace: std::time::Duration::from_millis(settings.start_grace_ms),
            stop_timeout: std::time::Duration::from_millis(settings.stop_timeout_ms),
            restart_pause: std::time::Duration::from_millis(settings.restart_pause_ms),
        },
    ));
    let acquirer = Arc::new(
        BinaryAcquirer::new(&settings, events.clone())
            .context("Failed to create binary acquirer")?,
    );

    // On panic, cancel the supervisor so monitor tasks stop and engine
    // children are torn down with their kill-on-drop handles.
    let supervisor_for_panic = supervisor.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Application panic: {:?}", panic_info);
        supervisor_for_panic.cancel();
    }));

    runtime.block_on(async {
        // Drain events into the operator log so progress is visible.
        let mut event_rx = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv().await {
                match event {
                    ManagerEvent::Acquisition(AcquisitionEvent::Downloading {
                        percent: Some(percent),
                        ..
                    }) if percent % 10 == 0 => {
                        tracing::info!("Engine download: {}%", percent);
                    }
                    ManagerEvent::Acquisition(AcquisitionEvent::Ready { path }) => {
                        tracing::info!("Engine ready at {}", path.display());
                    }
                    ManagerEvent::Acquisition(AcquisitionEvent::DownloadFailed { error }) => {
                        tracing::error!("Engine download failed: {}", error);
                    }
                    ManagerEvent::Registry(change) => {
                        tracing::info!("Registry change: {:?}", change);
                    }
                    _ => {}
                }
            }
        });

        if args.engine_path.is_none() {
            match acquirer
                .ensure_available(settings.auto_download, None)
                .await
            {
                Ok(path) => supervisor.set_engine_path(path),
                Err(e) => {
                    tracing::warn!(
                        "Engine not available yet ({}); starts will retry acquisition",
                        e
                    );
                }
            }
        }

        let registry = ProxyRegistry::load(
            settings.clone(),
            supervisor.clone(),
            acquirer.clone(),
            events.clone(),
        )
        .await
        .context("Failed to load registry")?;

        let stats = registry.stats();
        tracing::info!(
            "Managing {} prox(ies): {} running, {} stopped",
            stats.total,
            stats.running,
            stats.stopped
        );
        for descriptor in registry.list() {
            tracing::info!(
                "  {} -> {}:{} ({}, {})",
                descriptor.name,
                descriptor.address,
                descriptor.port,
                descriptor.protocol,
                if descriptor.status == ProxyStatus::Running {
                    "running"
                } else {
                    "stopped"
                }
            );
        }

        tracing::info!("Manager running. Press Ctrl+C to exit.");

        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl+C received, shutting down"),
            Err(e) => tracing::error!("Error listening for Ctrl+C: {}", e),
        }

        registry.shutdown().await;
        tracing::info!("Shutdown complete");

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
