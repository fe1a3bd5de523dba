//! Registration message codec.
//!
//! Backends announce themselves with JSON payloads on `router.register`
//! and withdraw with the same payload on `router.unregister`. Decoding
//! is strict about types and required fields: anything that does not
//! match the schema is rejected with a `MessageError`, never coerced.
//! Unknown fields are ignored so newer registrants keep working.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::types::{EndpointRecord, Uri};

/// The bus subjects the router listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Register,
    Unregister,
    Greet,
}

impl Subject {
    pub const ALL: [Subject; 3] = [Subject::Register, Subject::Unregister, Subject::Greet];

    /// Subject the router publishes its own announcement on.
    pub const START: &'static str = "router.start";

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Register => "router.register",
            Subject::Unregister => "router.unregister",
            Subject::Greet => "router.greet",
        }
    }

    pub fn parse(subject: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == subject)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Register(Registration),
    Unregister(Registration),
    /// Handshake from a registrant; answered with a `RouterStart`.
    Greet,
}

/// One endpoint announced under one or more URIs.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub uris: Vec<Uri>,
    pub record: EndpointRecord,
}

impl Registration {
    /// Registrations without URIs are accepted and ignored.
    pub fn is_noop(&self) -> bool {
        self.uris.is_empty()
    }
}

/// Wire schema of register/unregister payloads.
#[derive(Debug, Deserialize)]
struct RegistryMessage {
    host: Option<String>,
    port: Option<u16>,
    tls_port: Option<u16>,
    uris: Option<Vec<String>>,
    private_instance_id: Option<String>,
    route_service_url: Option<String>,
    server_cert_domain_san: Option<String>,
    stale_threshold_in_seconds: Option<u32>,
    tags: Option<BTreeMap<String, String>>,
    app: Option<String>,
}

/// Decode a payload received on `subject`.
pub fn decode(subject: Subject, payload: &[u8]) -> Result<RegistryEvent, MessageError> {
    match subject {
        Subject::Greet => Ok(RegistryEvent::Greet),
        Subject::Register => decode_registration(payload).map(RegistryEvent::Register),
        Subject::Unregister => decode_registration(payload).map(RegistryEvent::Unregister),
    }
}

fn decode_registration(payload: &[u8]) -> Result<Registration, MessageError> {
    let msg: RegistryMessage = serde_json::from_slice(payload)?;

    let host = non_empty(msg.host).ok_or(MessageError::MissingField("host"))?;
    let raw_uris = msg.uris.ok_or(MessageError::MissingField("uris"))?;
    let instance_id =
        non_empty(msg.private_instance_id).ok_or(MessageError::MissingField("private_instance_id"))?;

    let port = msg.port.unwrap_or(0);
    let tls_port = msg.tls_port.unwrap_or(0);
    if port == 0 && tls_port == 0 {
        return Err(MessageError::NoPort);
    }

    let uris = raw_uris
        .iter()
        .map(|raw| Uri::parse(raw).ok_or_else(|| MessageError::InvalidUri(raw.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Registration {
        uris,
        record: EndpointRecord {
            address: host,
            port,
            tls_port,
            instance_id,
            stale_threshold_secs: msg.stale_threshold_in_seconds.unwrap_or(0),
            route_service_url: non_empty(msg.route_service_url),
            server_cert_domain_san: non_empty(msg.server_cert_domain_san),
            tags: msg.tags.unwrap_or_default(),
            app_id: non_empty(msg.app),
        },
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// The router's own announcement, published on `router.start` and sent
/// as the reply to a greet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStart {
    pub id: String,
    pub hosts: Vec<String>,
    #[serde(rename = "minimumRegisterIntervalInSeconds")]
    pub minimum_register_interval_secs: u64,
    #[serde(rename = "pruneThresholdInSeconds")]
    pub prune_threshold_secs: u64,
}

impl RouterStart {
    pub fn to_json(&self) -> Vec<u8> {
        // A struct of strings and integers always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
