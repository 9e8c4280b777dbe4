//! The proxy registry: owns the persisted descriptor map and orchestrates
//! validation, config generation, process supervision and binary
//! acquisition behind the public control surface.
//!
//! Locking: operations on one proxy name are serialized by a per-name lock;
//! operations on different names run concurrently. The JSON store is guarded
//! by a separate lock held only for the read-modify-write of a persistence
//! cycle, never across a grace period or stop timeout.
//!
//! The registry never trusts its own persisted `status` for liveness; every
//! read merges the supervisor's live view.

use crate::core::acquire::BinaryAcquirer;
use crate::core::events::{EventBus, ManagerEvent, RegistryChange};
use crate::core::genconfig;
use crate::core::settings::ManagerSettings;
use crate::core::store;
use crate::core::supervisor::EngineSupervisor;
use crate::core::types::{ProxyDescriptor, ProxyStatus, RegistryDoc};
use crate::core::validate;
use crate::errors::{RegistryError, SupervisorError};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StopOutcome {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ProxyRegistry {
    doc: Arc<ArcSwap<RegistryDoc>>,
    store_lock: tokio::sync::Mutex<()>,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    registry_path: PathBuf,
    configs_dir: PathBuf,
    supervisor: Arc<EngineSupervisor>,
    acquirer: Arc<BinaryAcquirer>,
    events: EventBus,
    settings: Arc<ManagerSettings>,
}

impl ProxyRegistry {
    /// Load the persisted registry and wire the collaborators together.
    pub async fn load(
        settings: Arc<ManagerSettings>,
        supervisor: Arc<EngineSupervisor>,
        acquirer: Arc<BinaryAcquirer>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let registry_path = settings.registry_path();
        let doc: RegistryDoc = match store::load_or_init(&registry_path).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!("Failed to load registry: {}, starting empty", e);
                RegistryDoc::default()
            }
        };
        doc.validate()?;

        tracing::info!(
            "Registry loaded {} proxy definition(s) from {}",
            doc.proxies.len(),
            registry_path.display()
        );

        Ok(Self {
            doc: Arc::new(ArcSwap::from_pointee(doc)),
            store_lock: tokio::sync::Mutex::new(()),
            name_locks: Mutex::new(HashMap::new()),
            registry_path,
            configs_dir: settings.configs_dir(),
            supervisor,
            acquirer,
            events,
            settings,
        })
    }

    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }

    pub fn acquirer(&self) -> &Arc<BinaryAcquirer> {
        &self.acquirer
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.name_locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Add a new proxy: validate, generate and persist its engine config,
    /// store the descriptor with status stopped.
    pub async fn add(&self, mut descriptor: ProxyDescriptor) -> Result<(), RegistryError> {
        let report = validate::validate(&descriptor);
        if !report.valid() {
            return Err(RegistryError::Validation(report.message()));
        }

        let lock = self.name_lock(&descriptor.name);
        let _guard = lock.lock().await;

        if self.doc.load().proxies.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }

        let config_path = self.write_engine_config(&descriptor).await?;

        let now = Utc::now();
        descriptor.config_path = Some(config_path);
        descriptor.status = ProxyStatus::Stopped;
        descriptor.created_at = Some(now);
        descriptor.updated_at = Some(now);
        descriptor.last_started = None;
        descriptor.last_stopped = None;
        descriptor.live = None;

        let name = descriptor.name.clone();
        self.mutate_doc(|doc| {
            doc.proxies.insert(name.clone(), descriptor);
            Ok(())
        })
        .await?;

        tracing::info!("Added proxy '{}'", name);
        self.events
            .emit(ManagerEvent::Registry(RegistryChange::Added { name }));
        Ok(())
    }

    /// Replace a proxy's definition. A running proxy is stopped first and
    /// restarted with the regenerated config; if anything fails in between,
    /// the persisted status remains stopped rather than a stale running.
    pub async fn update(
        &self,
        name: &str,
        mut descriptor: ProxyDescriptor,
    ) -> Result<(), RegistryError> {
        descriptor.name = name.to_string();
        let report = validate::validate(&descriptor);
        if !report.valid() {
            return Err(RegistryError::Validation(report.message()));
        }

        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let previous = self
            .doc
            .load()
            .proxies
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let was_running = self.supervisor.is_running(name);
        if was_running {
            self.supervisor.stop(name).await?;
            // Record the stop before touching anything else that can fail.
            self.mark_stopped(name).await?;
        }

        let config_path = self.write_engine_config(&descriptor).await?;

        descriptor.config_path = Some(config_path.clone());
        descriptor.status = ProxyStatus::Stopped;
        descriptor.created_at = previous.created_at;
        descriptor.updated_at = Some(Utc::now());
        descriptor.last_started = previous.last_started;
        descriptor.last_stopped = previous.last_stopped;
        descriptor.live = None;

        let replacement = descriptor;
        self.mutate_doc(|doc| {
            doc.proxies.insert(name.to_string(), replacement);
            Ok(())
        })
        .await?;

        tracing::info!("Updated proxy '{}'", name);
        self.events.emit(ManagerEvent::Registry(RegistryChange::Updated {
            name: name.to_string(),
        }));

        if was_running {
            self.start_unlocked(name, &config_path).await?;
        }

        Ok(())
    }

    /// Remove a proxy, stopping it and deleting its generated config.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let descriptor = self
            .doc
            .load()
            .proxies
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match self.supervisor.stop(name).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(config_path) = &descriptor.config_path {
            if let Err(e) = tokio::fs::remove_file(config_path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!("Failed to remove config {}: {}", config_path.display(), e);
            }
        }

        self.mutate_doc(|doc| {
            doc.proxies.remove(name);
            Ok(())
        })
        .await?;

        tracing::info!("Deleted proxy '{}'", name);
        self.events.emit(ManagerEvent::Registry(RegistryChange::Removed {
            name: name.to_string(),
        }));
        Ok(())
    }

    /// Start a proxy's engine process, acquiring the engine binary first if
    /// it is missing and auto-download is enabled.
    pub async fn start(&self, name: &str) -> Result<(), RegistryError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let descriptor = self
            .doc
            .load()
            .proxies
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        // Regenerate a missing config rather than failing on it.
        let config_path = match &descriptor.config_path {
            Some(path) if path.exists() => path.clone(),
            _ => {
                tracing::warn!("Config for '{}' missing, regenerating", name);
                let path = self.write_engine_config(&descriptor).await?;
                let regenerated = path.clone();
                self.mutate_doc(|doc| {
                    if let Some(existing) = doc.proxies.get_mut(name) {
                        existing.config_path = Some(regenerated);
                    }
                    Ok(())
                })
                .await?;
                path
            }
        };

        self.start_unlocked(name, &config_path).await
    }

    /// Start path shared by `start` and `update`; assumes the caller holds
    /// the per-name lock.
    async fn start_unlocked(
        &self,
        name: &str,
        config_path: &std::path::Path,
    ) -> Result<(), RegistryError> {
        if self.supervisor.engine_path().is_none() {
            let engine = self
                .acquirer
                .ensure_available(self.settings.auto_download, None)
                .await?;
            self.supervisor.set_engine_path(engine);
        }

        self.supervisor.start(name, config_path).await?;

        self.mutate_doc(|doc| {
            if let Some(existing) = doc.proxies.get_mut(name) {
                existing.status = ProxyStatus::Running;
                existing.last_started = Some(Utc::now());
            }
            Ok(())
        })
        .await?;

        self.events.emit(ManagerEvent::Registry(RegistryChange::Started {
            name: name.to_string(),
        }));
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if !self.doc.load().proxies.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        self.supervisor.stop(name).await?;
        self.mark_stopped(name).await?;

        self.events.emit(ManagerEvent::Registry(RegistryChange::Stopped {
            name: name.to_string(),
        }));
        Ok(())
    }

    /// Restart a running proxy with its current config. Stopped proxies are
    /// rejected with NotRunning; use `start` for those.
    pub async fn restart(&self, name: &str) -> Result<(), RegistryError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if !self.doc.load().proxies.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        self.supervisor.restart(name).await?;

        self.mutate_doc(|doc| {
            if let Some(existing) = doc.proxies.get_mut(name) {
                existing.status = ProxyStatus::Running;
                existing.last_started = Some(Utc::now());
            }
            Ok(())
        })
        .await?;

        self.events.emit(ManagerEvent::Registry(RegistryChange::Started {
            name: name.to_string(),
        }));
        Ok(())
    }

    /// All descriptors with the supervisor's live status and uptime merged
    /// in.
    pub fn list(&self) -> Vec<ProxyDescriptor> {
        let doc = self.doc.load();
        doc.proxies
            .values()
            .map(|descriptor| self.with_live_status(descriptor))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ProxyDescriptor> {
        let doc = self.doc.load();
        doc.proxies
            .get(name)
            .map(|descriptor| self.with_live_status(descriptor))
    }

    /// Best-effort stop of every running proxy, reported per item.
    pub async fn stop_all(&self) -> Vec<StopOutcome> {
        let results = self.supervisor.stop_all().await;
        let mut outcomes = Vec::with_capacity(results.len());
        let mut stopped_names = Vec::new();

        for (name, result) in results {
            match result {
                Ok(()) => {
                    stopped_names.push(name.clone());
                    self.events.emit(ManagerEvent::Registry(RegistryChange::Stopped {
                        name: name.clone(),
                    }));
                    outcomes.push(StopOutcome {
                        name,
                        ok: true,
                        error: None,
                    });
                }
                Err(e) => outcomes.push(StopOutcome {
                    name,
                    ok: false,
                    error: Some(e.to_string()),
                }),
            }
        }

        if !stopped_names.is_empty() {
            let now = Utc::now();
            let result = self
                .mutate_doc(|doc| {
                    for name in &stopped_names {
                        if let Some(existing) = doc.proxies.get_mut(name) {
                            existing.status = ProxyStatus::Stopped;
                            existing.last_stopped = Some(now);
                        }
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Failed to persist stop-all bookkeeping: {}", e);
            }
        }

        outcomes
    }

    pub fn stats(&self) -> RegistryStats {
        let list = self.list();
        let running = list
            .iter()
            .filter(|d| d.status == ProxyStatus::Running)
            .count();
        RegistryStats {
            total: list.len(),
            running,
            stopped: list.len() - running,
        }
    }

    pub async fn shutdown(&self) {
        let outcomes = self.stop_all().await;
        let failed = outcomes.iter().filter(|o| !o.ok).count();
        if failed > 0 {
            tracing::warn!("{} prox(ies) failed to stop during shutdown", failed);
        }
        self.supervisor.shutdown().await;
    }

    fn with_live_status(&self, descriptor: &ProxyDescriptor) -> ProxyDescriptor {
        let live = self.supervisor.status(&descriptor.name);
        let mut merged = descriptor.clone();
        merged.status = live.status;
        merged.live = Some(live);
        merged
    }

    /// Generate, validate and atomically persist the engine config for a
    /// descriptor, returning its path.
    async fn write_engine_config(
        &self,
        descriptor: &ProxyDescriptor,
    ) -> Result<PathBuf, RegistryError> {
        // Apply the policy default only where the descriptor is silent.
        let mut effective = descriptor.clone();
        if let Some(stream) = effective.stream_settings.as_mut()
            && stream.allow_insecure.is_none()
        {
            stream.allow_insecure = Some(self.settings.allow_insecure_default);
        }

        let config = genconfig::generate(&effective, self.settings.inbound_profile)?;

        let report = validate::validate_engine_config(&config);
        if !report.valid() {
            return Err(RegistryError::Validation(report.message()));
        }

        let path = self
            .configs_dir
            .join(format!("{}.json", sanitize_filename(&descriptor.name)));
        store::save(&path, &config)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;

        Ok(path)
    }

    async fn mark_stopped(&self, name: &str) -> Result<(), RegistryError> {
        self.mutate_doc(|doc| {
            if let Some(existing) = doc.proxies.get_mut(name) {
                existing.status = ProxyStatus::Stopped;
                existing.last_stopped = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Serialized read-modify-write cycle against the JSON store. The new
    /// document only becomes visible once it has hit disk.
    async fn mutate_doc<F>(&self, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut RegistryDoc) -> Result<(), RegistryError>,
    {
        let _guard = self.store_lock.lock().await;

        let mut new_doc = (**self.doc.load()).clone();
        mutate(&mut new_doc)?;

        store::save(&self.registry_path, &new_doc)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        self.doc.store(Arc::new(new_doc));
        Ok(())
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
