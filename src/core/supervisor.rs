//! Engine process supervision: one child process per proxy name, with an
//! in-memory live-record map as the single source of truth for liveness.
//!
//! State machine per name: absent -> starting -> running -> absent. A start
//! that dies before the grace period elapses never reaches running. All
//! mutation of the record map goes through start/stop/reap paths; operations
//! on the same name are serialized by a per-name lock while different names
//! proceed concurrently.

use crate::core::logs::{LogAggregator, LogSource};
use crate::core::types::{LiveStatus, ProcessId, ProxyStatus, Timestamp};
use crate::errors::SupervisorError;
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Starting,
    Running,
}

struct ProcessRecord {
    child: Option<Child>,
    monitor_task: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    config_path: PathBuf,
    started_at: Timestamp,
    state: ProcessState,
}

impl ProcessRecord {
    fn pid(&self) -> Option<ProcessId> {
        self.child
            .as_ref()
            .and_then(|child| child.id().map(ProcessId::from))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub start_grace: Duration,
    pub stop_timeout: Duration,
    pub restart_pause: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_millis(1500),
            stop_timeout: Duration::from_secs(5),
            restart_pause: Duration::from_millis(300),
        }
    }
}

pub struct EngineSupervisor {
    engine_path: ArcSwapOption<PathBuf>,
    records: Mutex<HashMap<String, ProcessRecord>>,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    logs: Arc<LogAggregator>,
    timings: SupervisorTimings,
    cancellation_token: CancellationToken,
}

impl EngineSupervisor {
    pub fn new(
        engine_path: Option<PathBuf>,
        logs: Arc<LogAggregator>,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            engine_path: ArcSwapOption::from(engine_path.map(Arc::new)),
            records: Mutex::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
            logs,
            timings,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn engine_path(&self) -> Option<PathBuf> {
        self.engine_path.load_full().map(|p| (*p).clone())
    }

    pub fn set_engine_path(&self, path: PathBuf) {
        self.engine_path.store(Some(Arc::new(path)));
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.name_locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Start the engine for `name` with the given config file. Succeeds only
    /// once the process has survived the grace period.
    pub async fn start(&self, name: &str, config_path: &Path) -> Result<ProcessId, SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.do_start(name, config_path).await
    }

    async fn do_start(&self, name: &str, config_path: &Path) -> Result<ProcessId, SupervisorError> {
        self.reap_dead_records();

        if !config_path.exists() {
            return Err(SupervisorError::ConfigMissing {
                path: config_path.to_path_buf(),
            });
        }

        if self.records.lock().unwrap().contains_key(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let binary_path = self
            .engine_path
            .load_full()
            .ok_or(SupervisorError::EngineNotAvailable)?;

        let mut child = spawn_engine_process(&binary_path, config_path)?;
        let pid = child
            .id()
            .map(ProcessId::from)
            .ok_or_else(|| SupervisorError::Spawn("no pid after spawn".to_string()))?;

        let child_token = self.cancellation_token.child_token();
        let stderr_tail = Arc::new(tokio::sync::Mutex::new(String::new()));
        let monitor_task = spawn_monitor_task(
            name.to_string(),
            &mut child,
            self.logs.clone(),
            stderr_tail.clone(),
            child_token.clone(),
        )?;

        tracing::info!("Started engine for proxy '{}' with PID {}", name, pid);

        self.records.lock().unwrap().insert(
            name.to_string(),
            ProcessRecord {
                child: Some(child),
                monitor_task: Some(monitor_task),
                cancellation_token: child_token,
                config_path: config_path.to_path_buf(),
                started_at: Timestamp::now(),
                state: ProcessState::Starting,
            },
        );

        // The process must outlive the grace period before the start counts.
        tokio::time::sleep(self.timings.start_grace).await;

        let exited = {
            let mut records = self.records.lock().unwrap();

            // None = still alive; Some(code) = exited (or record lost to a
            // reap while we slept).
            let verdict = match records.get_mut(name) {
                Some(record) => match record.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => Some(status.code()),
                        Ok(None) => None,
                        Err(e) => {
                            tracing::error!(
                                "Error checking engine status for '{}': {}",
                                name,
                                e
                            );
                            Some(None)
                        }
                    },
                    None => Some(None),
                },
                None => Some(None),
            };

            match verdict {
                None => {
                    if let Some(record) = records.get_mut(name) {
                        record.state = ProcessState::Running;
                    }
                    None
                }
                Some(code) => {
                    records.remove(name);
                    Some(code)
                }
            }
        };

        match exited {
            None => Ok(pid),
            Some(code) => {
                let stderr = stderr_tail.lock().await.clone();
                tracing::error!(
                    "Engine for proxy '{}' exited during startup (code {:?})",
                    name,
                    code
                );
                Err(SupervisorError::StartFailed { code, stderr })
            }
        }
    }

    /// Stop the engine for `name`, force-killing after the stop timeout. The
    /// record is removed even on the force-kill path.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.do_stop(name).await
    }

    async fn do_stop(&self, name: &str) -> Result<(), SupervisorError> {
        let mut record = self
            .records
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;

        record.cancellation_token.cancel();

        if let Some(mut child) = record.child.take() {
            let pid = child.id();

            match child.start_kill() {
                Ok(_) => {
                    tracing::info!("Sent kill signal to process {:?}", pid);
                }
                Err(e) => {
                    tracing::warn!("Failed to send kill signal to process {:?}: {}", pid, e);
                }
            }

            match tokio::time::timeout(self.timings.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    let code = status.code();
                    tracing::info!(
                        "Process {:?} exited with status: {} (code: {:?})",
                        pid,
                        status,
                        code
                    );
                    if let Some(code) = code
                        && code != 0
                    {
                        tracing::warn!(
                            "Proxy '{}' stopped with non-zero exit code: {}",
                            name,
                            code
                        );
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Error waiting for process {:?}: {}", pid, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Process {:?} did not exit within timeout, forcing kill",
                        pid
                    );
                    if let Err(e) = child.kill().await {
                        tracing::error!("Force kill of process {:?} failed: {}", pid, e);
                    }
                }
            }
        }

        if let Some(monitor_task) = record.monitor_task.take() {
            monitor_task.abort();
            let _ = monitor_task.await;
        }

        tracing::info!("Stopped proxy '{}'", name);
        Ok(())
    }

    /// Stop then start with the record's last known config path. Only
    /// applies to running proxies; a stopped proxy is started with `start`.
    pub async fn restart(&self, name: &str) -> Result<ProcessId, SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let config_path = {
            let records = self.records.lock().unwrap();
            records
                .get(name)
                .map(|record| record.config_path.clone())
                .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?
        };

        self.do_stop(name).await?;

        // Give the OS a moment to release the listening port.
        tokio::time::sleep(self.timings.restart_pause).await;

        self.do_start(name, &config_path).await
    }

    /// Non-blocking read of a proxy's live state.
    pub fn status(&self, name: &str) -> LiveStatus {
        self.reap_dead_records();

        let records = self.records.lock().unwrap();
        match records.get(name) {
            Some(record) if record.pid().is_some() => LiveStatus {
                status: match record.state {
                    ProcessState::Running => ProxyStatus::Running,
                    // A starting process counts as running for liveness: it
                    // has a live record and a second start must be rejected.
                    ProcessState::Starting => ProxyStatus::Running,
                },
                pid: record.pid(),
                started_at: Some(record.started_at),
                uptime: Some(record.started_at.elapsed()),
            },
            _ => LiveStatus::stopped(),
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.status(name).status == ProxyStatus::Running
    }

    pub fn running_names(&self) -> Vec<String> {
        self.reap_dead_records();
        self.records.lock().unwrap().keys().cloned().collect()
    }

    /// Best-effort stop of every live record; failures do not abort the
    /// batch.
    pub async fn stop_all(&self) -> Vec<(String, Result<(), SupervisorError>)> {
        let names = self.running_names();
        let mut results = Vec::with_capacity(names.len());

        for name in names {
            let result = self.stop(&name).await;
            if let Err(ref e) = result {
                tracing::error!("Failed to stop proxy '{}': {}", name, e);
            }
            results.push((name, result));
        }

        results
    }

    /// Synchronous cancellation signal for panic/teardown paths; monitor
    /// tasks observe it and stop streaming.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down supervisor, stopping all engines");
        self.cancellation_token.cancel();
        let results = self.stop_all().await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            tracing::warn!("{} engine(s) failed to stop cleanly", failed);
        }
        tracing::info!("Supervisor shutdown complete");
    }

    /// Remove records whose process has exited on its own, classifying the
    /// exit code. Zero is a normal exit; anything else is logged. No
    /// automatic retry happens here; retry policy belongs to the caller.
    fn reap_dead_records(&self) {
        let mut records = self.records.lock().unwrap();
        let dead: Vec<String> = records
            .iter_mut()
            .filter_map(|(name, record)| {
                if let Some(ref mut child) = record.child {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            match status.code() {
                                Some(0) => tracing::info!(
                                    "Engine for proxy '{}' exited normally",
                                    name
                                ),
                                code => tracing::warn!(
                                    "Engine for proxy '{}' exited abnormally (code: {:?})",
                                    name,
                                    code
                                ),
                            }
                            Some(name.clone())
                        }
                        Ok(None) => None,
                        Err(e) => {
                            tracing::error!(
                                "Error checking engine status for proxy '{}': {}",
                                name,
                                e
                            );
                            Some(name.clone())
                        }
                    }
                } else {
                    Some(name.clone())
                }
            })
            .collect();

        for name in dead {
            if let Some(mut record) = records.remove(&name) {
                record.cancellation_token.cancel();
                if let Some(monitor_task) = record.monitor_task.take() {
                    monitor_task.abort();
                }
                tracing::info!("Cleaned up dead record for proxy '{}'", name);
            }
        }
    }
}

fn spawn_engine_process(binary_path: &Path, config_path: &Path) -> Result<Child, SupervisorError> {
    tracing::info!(
        "Spawning engine process: {} run -c {}",
        binary_path.display(),
        config_path.display()
    );

    let mut command = Command::new(binary_path);
    command
        .arg("run")
        .arg("-c")
        .arg(config_path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    command.spawn().map_err(|e| {
        let error_msg = e.to_string();
        if error_msg.contains("No such file or directory")
            || error_msg.contains("cannot find the path")
        {
            SupervisorError::Spawn(format!(
                "engine binary not found at {}",
                binary_path.display()
            ))
        } else if error_msg.contains("Permission denied") {
            SupervisorError::Spawn(format!(
                "permission denied executing engine binary at {}",
                binary_path.display()
            ))
        } else {
            SupervisorError::Spawn(error_msg)
        }
    })
}

/// Forward the child's stdout/stderr lines into the log aggregator, keeping
/// a bounded stderr tail for startup-failure reporting.
fn spawn_monitor_task(
    proxy_name: String,
    child: &mut Child,
    logs: Arc<LogAggregator>,
    stderr_tail: Arc<tokio::sync::Mutex<String>>,
    cancellation_token: CancellationToken,
) -> Result<JoinHandle<()>, SupervisorError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::Spawn("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SupervisorError::Spawn("failed to capture stderr".to_string()))?;

    let task = tokio::spawn(async move {
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::debug!("Monitor task cancelled for proxy '{}'", proxy_name);
                    break;
                }
                result = stdout_lines.next_line(), if stdout_open => {
                    match result {
                        Ok(Some(line)) => {
                            logs.ingest(&proxy_name, LogSource::Stdout, line);
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            tracing::error!("Error reading stdout for '{}': {}", proxy_name, e);
                            stdout_open = false;
                        }
                    }
                }
                result = stderr_lines.next_line(), if stderr_open => {
                    match result {
                        Ok(Some(line)) => {
                            let mut tail = stderr_tail.lock().await;
                            tail.push_str(&line);
                            tail.push('\n');
                            if tail.len() > STDERR_TAIL_LIMIT {
                                let cut = tail.len() - STDERR_TAIL_LIMIT;
                                let boundary = tail
                                    .char_indices()
                                    .map(|(i, _)| i)
                                    .find(|&i| i >= cut)
                                    .unwrap_or(0);
                                tail.drain(..boundary);
                            }
                            drop(tail);

                            logs.ingest(&proxy_name, LogSource::Stderr, line);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::error!("Error reading stderr for '{}': {}", proxy_name, e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        tracing::debug!("Output streams closed for proxy '{}'", proxy_name);
    });

    Ok(task)
}
