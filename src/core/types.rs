use anyhow::ensure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    pub fn all() -> impl Iterator<Item = Self> {
        use strum::IntoEnumIterator;
        Self::iter()
    }

    /// Tag used in the generated engine config.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
        }
    }

    pub fn requires_user_id(&self) -> bool {
        matches!(self, Protocol::Vless | Protocol::Vmess)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum TransportNetwork {
    #[default]
    Tcp,
    Ws,
    H2,
    Grpc,
    Xhttp,
}

impl TransportNetwork {
    pub fn tag(&self) -> &'static str {
        match self {
            TransportNetwork::Tcp => "tcp",
            TransportNetwork::Ws => "ws",
            TransportNetwork::H2 => "h2",
            TransportNetwork::Grpc => "grpc",
            TransportNetwork::Xhttp => "xhttp",
        }
    }
}

impl fmt::Display for TransportNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSecurity {
    #[default]
    None,
    Tls,
    Reality,
}

/// Transport and security options for an outbound connection. Only the
/// fields matching `network` are carried into the engine config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    pub network: TransportNetwork,

    #[serde(default)]
    pub security: TransportSecurity,

    /// ws / h2 / xhttp request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// ws / h2 / xhttp host header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// grpc service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// xhttp mode: auto, packet-up, stream-up or stream-one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Opaque xhttp tuning knobs, passed through to the engine verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,

    /// TLS SNI. Defaults to the proxy address when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Explicit opt-in only. An omitted value means false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_insecure: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,

    /// Reality public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Reality short id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Running,
    #[default]
    Stopped,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyStatus::Running => write!(f, "running"),
            ProxyStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed().unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_rfc3339(self.0))
    }
}

/// Live view of a proxy's process, as reported by the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct LiveStatus {
    pub status: ProxyStatus,
    pub pid: Option<ProcessId>,
    pub started_at: Option<Timestamp>,
    pub uptime: Option<Duration>,
}

impl LiveStatus {
    pub fn stopped() -> Self {
        Self {
            status: ProxyStatus::Stopped,
            pid: None,
            started_at: None,
            uptime: None,
        }
    }
}

/// User-facing proxy definition, persisted in the registry document.
///
/// `status` mirrors the supervisor's live view and is refreshed on every
/// read; the registry never trusts the persisted copy for liveness
/// decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub local_port: u16,
    pub protocol: Protocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub status: ProxyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub live: Option<LiveStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDoc {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyDescriptor>,
}

fn default_version() -> u32 {
    1
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: default_version(),
            proxies: BTreeMap::new(),
        }
    }
}

impl RegistryDoc {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.version == 1,
            "Unsupported registry version: {}. Expected version 1",
            self.version
        );

        for (key, descriptor) in &self.proxies {
            ensure!(
                !key.trim().is_empty(),
                "Registry contains a proxy with an empty name"
            );
            ensure!(
                key == &descriptor.name,
                "Registry key '{}' does not match descriptor name '{}'",
                key,
                descriptor.name
            );
        }

        Ok(())
    }
}
