//! Pure transform from a [`ProxyDescriptor`] to the JSON configuration the
//! engine binary consumes. No I/O; the registry persists the result.

use crate::core::types::{
    Protocol, ProxyDescriptor, StreamSettings, TransportNetwork, TransportSecurity,
};
use crate::errors::GenerateError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which inbound shape to generate. `Socks` is the default profile: a local
/// SOCKS5 listener on the loopback interface. `Forward` is the alternate
/// single-purpose profile: a dokodemo-door inbound forwarding straight to
/// the descriptor's remote address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum InboundProfile {
    #[default]
    Socks,
    Forward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundSettings {
    Socks { auth: String, udp: bool },
    Forward { address: String, port: u16, network: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<TrojanServer> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnextUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealityConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub server_name: String,
    pub allow_insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityConfig {
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcConfig {
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XhttpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

pub const INBOUND_TAG: &str = "local-in";
pub const OUTBOUND_TAG: &str = "proxy-out";

/// Generate an engine config for the descriptor. Deterministic except when
/// `user_id` is omitted for vless/vmess, in which case a v4 UUID is drawn
/// from the default generator; see [`generate_with`] to inject one.
pub fn generate(
    descriptor: &ProxyDescriptor,
    profile: InboundProfile,
) -> Result<EngineConfig, GenerateError> {
    generate_with(descriptor, profile, || Uuid::new_v4().to_string())
}

/// [`generate`] with an injectable id generator, so tests and callers that
/// need reproducible output can supply their own.
pub fn generate_with<F>(
    descriptor: &ProxyDescriptor,
    profile: InboundProfile,
    id_gen: F,
) -> Result<EngineConfig, GenerateError>
where
    F: Fn() -> String,
{
    let inbound = build_inbound(descriptor, profile);
    let outbound = build_outbound(descriptor, id_gen)?;

    Ok(EngineConfig {
        log: LogSettings {
            loglevel: "warning".to_string(),
        },
        inbounds: vec![inbound],
        outbounds: vec![outbound],
    })
}

fn build_inbound(descriptor: &ProxyDescriptor, profile: InboundProfile) -> Inbound {
    match profile {
        InboundProfile::Socks => Inbound {
            tag: INBOUND_TAG.to_string(),
            listen: "127.0.0.1".to_string(),
            port: descriptor.local_port,
            protocol: "socks".to_string(),
            settings: InboundSettings::Socks {
                auth: "noauth".to_string(),
                udp: true,
            },
        },
        InboundProfile::Forward => Inbound {
            tag: INBOUND_TAG.to_string(),
            listen: "127.0.0.1".to_string(),
            port: descriptor.local_port,
            protocol: "dokodemo-door".to_string(),
            settings: InboundSettings::Forward {
                address: descriptor.address.clone(),
                port: descriptor.port,
                network: "tcp,udp".to_string(),
            },
        },
    }
}

fn build_outbound<F>(descriptor: &ProxyDescriptor, id_gen: F) -> Result<Outbound, GenerateError>
where
    F: Fn() -> String,
{
    let settings = match descriptor.protocol {
        Protocol::Vless => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: descriptor.address.clone(),
                port: descriptor.port,
                users: vec![VnextUser {
                    id: descriptor.user_id.clone().unwrap_or_else(&id_gen),
                    encryption: Some("none".to_string()),
                    security: None,
                }],
            }],
        },
        Protocol::Vmess => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: descriptor.address.clone(),
                port: descriptor.port,
                users: vec![VnextUser {
                    id: descriptor.user_id.clone().unwrap_or_else(&id_gen),
                    encryption: None,
                    security: Some("auto".to_string()),
                }],
            }],
        },
        Protocol::Trojan => OutboundSettings::Servers {
            servers: vec![TrojanServer {
                address: descriptor.address.clone(),
                port: descriptor.port,
                password: descriptor
                    .password
                    .clone()
                    .ok_or(GenerateError::MissingPassword)?,
            }],
        },
    };

    Ok(Outbound {
        tag: OUTBOUND_TAG.to_string(),
        protocol: descriptor.protocol.tag().to_string(),
        settings,
        stream_settings: descriptor
            .stream_settings
            .as_ref()
            .map(|s| build_stream(descriptor, s)),
    })
}

fn build_stream(descriptor: &ProxyDescriptor, settings: &StreamSettings) -> StreamConfig {
    let server_name = settings
        .server_name
        .clone()
        .unwrap_or_else(|| descriptor.address.clone());

    let mut stream = StreamConfig {
        network: settings.network.tag().to_string(),
        security: None,
        tls_settings: None,
        reality_settings: None,
        ws_settings: None,
        http_settings: None,
        grpc_settings: None,
        xhttp_settings: None,
    };

    match settings.security {
        TransportSecurity::None => {}
        TransportSecurity::Tls => {
            stream.security = Some("tls".to_string());
            stream.tls_settings = Some(TlsConfig {
                server_name,
                // Never defaulted to true: absent means false.
                allow_insecure: settings.allow_insecure.unwrap_or(false),
                fingerprint: settings.fingerprint.clone(),
                alpn: settings.alpn.clone(),
            });
        }
        TransportSecurity::Reality => {
            stream.security = Some("reality".to_string());
            stream.reality_settings = Some(RealityConfig {
                server_name,
                fingerprint: settings.fingerprint.clone(),
                public_key: settings.public_key.clone(),
                short_id: settings.short_id.clone(),
            });
        }
    }

    match settings.network {
        TransportNetwork::Tcp => {}
        TransportNetwork::Ws => {
            stream.ws_settings = Some(WsConfig {
                path: settings.path.clone().unwrap_or_else(|| "/".to_string()),
                host: settings.host.clone(),
            });
        }
        TransportNetwork::H2 => {
            stream.http_settings = Some(HttpConfig {
                path: settings.path.clone(),
                host: settings.host.clone().map(|h| vec![h]),
            });
        }
        TransportNetwork::Grpc => {
            stream.grpc_settings = Some(GrpcConfig {
                service_name: settings.service_name.clone().unwrap_or_default(),
            });
        }
        TransportNetwork::Xhttp => {
            stream.xhttp_settings = Some(XhttpConfig {
                host: settings.host.clone(),
                path: settings.path.clone(),
                mode: settings.mode.clone(),
                extra: settings.extra.clone(),
            });
        }
    }

    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProxyStatus;

    fn base_descriptor(protocol: Protocol) -> ProxyDescriptor {
        ProxyDescriptor {
            name: "test".to_string(),
            address: "example.com".to_string(),
            port: 443,
            local_port: 1080,
            protocol,
            user_id: Some("550e8400-e29b-41d4-a716-446655440000".to_string()),
            password: Some("hunter2".to_string()),
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

    #[test]
    fn outbound_protocol_matches_descriptor() {
        for protocol in Protocol::all() {
            let descriptor = base_descriptor(protocol);
            let config = generate(&descriptor, InboundProfile::Socks).unwrap();
            assert_eq!(config.outbounds.len(), 1);
            assert_eq!(config.outbounds[0].protocol, protocol.tag());
            assert_eq!(config.inbounds.len(), 1);
            assert_eq!(config.inbounds[0].port, 1080);
        }
    }

    #[test]
    fn socks_profile_is_loopback_listener() {
        let config =
            generate(&base_descriptor(Protocol::Vless), InboundProfile::Socks).unwrap();
        let inbound = &config.inbounds[0];
        assert_eq!(inbound.protocol, "socks");
        assert_eq!(inbound.listen, "127.0.0.1");
        match &inbound.settings {
            InboundSettings::Socks { auth, udp } => {
                assert_eq!(auth, "noauth");
                assert!(udp);
            }
            other => panic!("expected socks settings, got {other:?}"),
        }
    }

    #[test]
    fn forward_profile_targets_remote() {
        let config =
            generate(&base_descriptor(Protocol::Vless), InboundProfile::Forward).unwrap();
        let inbound = &config.inbounds[0];
        assert_eq!(inbound.protocol, "dokodemo-door");
        match &inbound.settings {
            InboundSettings::Forward { address, port, .. } => {
                assert_eq!(address, "example.com");
                assert_eq!(*port, 443);
            }
            other => panic!("expected forward settings, got {other:?}"),
        }
    }

    #[test]
    fn vless_user_carries_id_and_no_encryption() {
        let config =
            generate(&base_descriptor(Protocol::Vless), InboundProfile::Socks).unwrap();
        match &config.outbounds[0].settings {
            OutboundSettings::Vnext { vnext } => {
                assert_eq!(vnext[0].users.len(), 1);
                assert_eq!(
                    vnext[0].users[0].id,
                    "550e8400-e29b-41d4-a716-446655440000"
                );
                assert_eq!(vnext[0].users[0].encryption.as_deref(), Some("none"));
                assert!(vnext[0].users[0].security.is_none());
            }
            other => panic!("expected vnext settings, got {other:?}"),
        }
    }

    #[test]
    fn vmess_user_defaults_to_auto_security() {
        let config =
            generate(&base_descriptor(Protocol::Vmess), InboundProfile::Socks).unwrap();
        match &config.outbounds[0].settings {
            OutboundSettings::Vnext { vnext } => {
                assert_eq!(vnext[0].users[0].security.as_deref(), Some("auto"));
                assert!(vnext[0].users[0].encryption.is_none());
            }
            other => panic!("expected vnext settings, got {other:?}"),
        }
    }

    #[test]
    fn trojan_without_password_fails() {
        let mut descriptor = base_descriptor(Protocol::Trojan);
        descriptor.password = None;
        let result = generate(&descriptor, InboundProfile::Socks);
        assert!(matches!(result, Err(GenerateError::MissingPassword)));
    }

    #[test]
    fn omitted_user_id_uses_injected_generator() {
        let mut descriptor = base_descriptor(Protocol::Vless);
        descriptor.user_id = None;
        let config = generate_with(&descriptor, InboundProfile::Socks, || {
            "11111111-2222-3333-4444-555555555555".to_string()
        })
        .unwrap();
        match &config.outbounds[0].settings {
            OutboundSettings::Vnext { vnext } => {
                assert_eq!(vnext[0].users[0].id, "11111111-2222-3333-4444-555555555555");
            }
            other => panic!("expected vnext settings, got {other:?}"),
        }
    }

    #[test]
    fn tls_server_name_defaults_to_address() {
        let mut descriptor = base_descriptor(Protocol::Vless);
        descriptor.stream_settings = Some(StreamSettings {
            network: TransportNetwork::Ws,
            security: TransportSecurity::Tls,
            path: Some("/ws".to_string()),
            ..Default::default()
        });

        let config = generate(&descriptor, InboundProfile::Socks).unwrap();
        let stream = config.outbounds[0].stream_settings.as_ref().unwrap();
        assert_eq!(stream.network, "ws");
        assert_eq!(stream.security.as_deref(), Some("tls"));
        let tls = stream.tls_settings.as_ref().unwrap();
        assert_eq!(tls.server_name, "example.com");
        assert!(!tls.allow_insecure);
        assert_eq!(stream.ws_settings.as_ref().unwrap().path, "/ws");
    }

    #[test]
    fn network_specific_blocks_only_for_matching_network() {
        let mut descriptor = base_descriptor(Protocol::Vless);
        descriptor.stream_settings = Some(StreamSettings {
            network: TransportNetwork::Grpc,
            service_name: Some("svc".to_string()),
            path: Some("/ignored".to_string()),
            ..Default::default()
        });

        let config = generate(&descriptor, InboundProfile::Socks).unwrap();
        let stream = config.outbounds[0].stream_settings.as_ref().unwrap();
        assert!(stream.ws_settings.is_none());
        assert!(stream.http_settings.is_none());
        assert!(stream.xhttp_settings.is_none());
        assert_eq!(stream.grpc_settings.as_ref().unwrap().service_name, "svc");
    }

    #[test]
    fn xhttp_fields_passed_through() {
        let mut descriptor = base_descriptor(Protocol::Vless);
        descriptor.stream_settings = Some(StreamSettings {
            network: TransportNetwork::Xhttp,
            security: TransportSecurity::Tls,
            host: Some("cdn.example.com".to_string()),
            path: Some("/push".to_string()),
            mode: Some("stream-up".to_string()),
            extra: Some(serde_json::json!({"scMaxEachPostBytes": 1000000})),
            ..Default::default()
        });

        let config = generate(&descriptor, InboundProfile::Socks).unwrap();
        let stream = config.outbounds[0].stream_settings.as_ref().unwrap();
        let xhttp = stream.xhttp_settings.as_ref().unwrap();
        assert_eq!(xhttp.mode.as_deref(), Some("stream-up"));
        assert_eq!(xhttp.host.as_deref(), Some("cdn.example.com"));
        assert!(xhttp.extra.is_some());
    }

    #[test]
    fn serialized_config_uses_engine_field_names() {
        let mut descriptor = base_descriptor(Protocol::Trojan);
        descriptor.stream_settings = Some(StreamSettings {
            network: TransportNetwork::Tcp,
            security: TransportSecurity::Tls,
            allow_insecure: Some(true),
            ..Default::default()
        });

        let config = generate(&descriptor, InboundProfile::Socks).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["log"]["loglevel"], "warning");
        assert_eq!(
            json["outbounds"][0]["streamSettings"]["tlsSettings"]["allowInsecure"],
            true
        );
        assert_eq!(
            json["outbounds"][0]["settings"]["servers"][0]["password"],
            "hunter2"
        );
    }
}
