//! Structural and semantic validation of proxy descriptors and generated
//! engine configs. Every rule is checked and every violation collected; a
//! report is returned rather than failing on the first problem.

use crate::core::genconfig::EngineConfig;
use crate::core::types::{ProxyDescriptor, TransportNetwork};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub const XHTTP_MODES: [&str; 4] = ["auto", "packet-up", "stream-up", "stream-one"];

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All violations as one caller-facing message.
    pub fn message(&self) -> String {
        self.errors.join("; ")
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

pub fn validate(descriptor: &ProxyDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();

    if descriptor.name.trim().is_empty() {
        report.fail("name cannot be empty");
    }

    if !is_valid_address(&descriptor.address) {
        report.fail(format!(
            "address '{}' is not a valid IPv4 address or domain name",
            descriptor.address
        ));
    }

    if descriptor.port == 0 {
        report.fail("port must be between 1 and 65535");
    }

    if descriptor.local_port == 0 {
        report.fail("local port must be between 1 and 65535");
    }

    if descriptor.protocol.requires_user_id() {
        match descriptor.user_id.as_deref() {
            None => report.fail(format!("{} requires a user id", descriptor.protocol)),
            Some(id) if Uuid::parse_str(id).is_err() => {
                report.fail(format!("user id '{}' is not a valid UUID", id));
            }
            Some(_) => {}
        }
    } else if descriptor
        .password
        .as_deref()
        .is_none_or(|p| p.is_empty())
    {
        report.fail("trojan requires a non-empty password");
    }

    if let Some(stream) = &descriptor.stream_settings {
        // network and security are closed enums; only the free-form xhttp
        // mode needs a membership check.
        if let Some(mode) = &stream.mode
            && stream.network == TransportNetwork::Xhttp
            && !XHTTP_MODES.contains(&mode.as_str())
        {
            report.fail(format!(
                "xhttp mode '{}' is not one of: {}",
                mode,
                XHTTP_MODES.join(", ")
            ));
        }
        if stream.network == TransportNetwork::Grpc
            && stream.service_name.as_deref().is_none_or(|s| s.is_empty())
        {
            report.fail("grpc transport requires a service name");
        }
    }

    report
}

/// Validation of the generated artifact, applied before it is persisted for
/// the engine to consume.
pub fn validate_engine_config(config: &EngineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.inbounds.is_empty() {
        report.fail("engine config has no inbounds");
    }
    if config.outbounds.is_empty() {
        report.fail("engine config has no outbounds");
    }

    for (index, inbound) in config.inbounds.iter().enumerate() {
        if inbound.port == 0 {
            report.fail(format!("inbound {} has an invalid port", index));
        }
        if inbound.protocol.is_empty() {
            report.fail(format!("inbound {} has no protocol tag", index));
        }
    }

    for (index, outbound) in config.outbounds.iter().enumerate() {
        if outbound.protocol.is_empty() {
            report.fail(format!("outbound {} has no protocol tag", index));
        }
    }

    report
}

/// IPv4 literal or DNS-style domain: dot-separated labels of alphanumerics
/// and hyphens, no label starting or ending with a hyphen.
fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > 253 {
        return false;
    }

    if address.parse::<Ipv4Addr>().is_ok() {
        return true;
    }

    address.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
