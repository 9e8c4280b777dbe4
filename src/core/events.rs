//! Change notifications pushed from the core to embedding collaborators.
//!
//! The core writes to a broadcast channel and collaborators drain their own
//! receivers; a slow subscriber lags and drops its oldest events instead of
//! blocking the core.

use crate::core::logs::LogEntry;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RegistryChange {
    Added { name: String },
    Updated { name: String },
    Removed { name: String },
    Started { name: String },
    Stopped { name: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum AcquisitionEvent {
    Initializing,
    Downloading {
        percent: Option<u8>,
        downloaded: u64,
        total: Option<u64>,
    },
    Ready {
        path: PathBuf,
    },
    DownloadRequired {
        reason: String,
    },
    DownloadFailed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ManagerEvent {
    Log { entry: LogEntry },
    LogsCleared { proxy_name: Option<String> },
    Registry(RegistryChange),
    Acquisition(AcquisitionEvent),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }

    /// Best-effort emit; an event with no subscribers is dropped.
    pub fn emit(&self, event: ManagerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
