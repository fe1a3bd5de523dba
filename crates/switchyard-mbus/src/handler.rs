//! Applies decoded bus messages to the route table.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use switchyard_core::message::decode;
use switchyard_core::{Lifecycle, MessageError, RegistryEvent, RouterStart, Subject};
use switchyard_registry::{RouteTable, UpsertOutcome};

/// What handling one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Registration applied; counts per outcome across all URIs.
    Registered { added: usize, updated: usize, refreshed: usize },
    /// Number of (uri, instance) pairs actually removed.
    Unregistered(usize),
    /// Greet answered with this payload.
    Greeted(Bytes),
    /// Message dropped because the router is draining.
    Frozen,
    /// Subject the router does not handle, or a registration with no URIs.
    Ignored,
}

impl Applied {
    /// Payload to send back on the message's reply subject, if any.
    pub fn reply(&self) -> Option<&Bytes> {
        match self {
            Applied::Greeted(payload) => Some(payload),
            _ => None,
        }
    }
}

pub struct RegistryHandler {
    table: Arc<RouteTable>,
    lifecycle: Lifecycle,
    start: Bytes,
}

impl RegistryHandler {
    pub fn new(table: Arc<RouteTable>, lifecycle: Lifecycle, start: &RouterStart) -> Self {
        Self {
            table,
            lifecycle,
            start: Bytes::from(start.to_json()),
        }
    }

    /// The `router.start` payload, published on every (re)connect.
    pub fn start_payload(&self) -> Bytes {
        self.start.clone()
    }

    /// Decode and apply one message received on `subject`.
    pub fn handle(&self, subject: &str, payload: &[u8]) -> Result<Applied, MessageError> {
        let Some(subject) = Subject::parse(subject) else {
            return Ok(Applied::Ignored);
        };

        match decode(subject, payload)? {
            RegistryEvent::Greet => Ok(Applied::Greeted(self.start.clone())),
            RegistryEvent::Register(reg) | RegistryEvent::Unregister(reg) if reg.is_noop() => {
                debug!(%subject, instance_id = %reg.record.instance_id, "registration without uris");
                Ok(Applied::Ignored)
            }
            RegistryEvent::Register(_) | RegistryEvent::Unregister(_)
                if !self.lifecycle.is_running() =>
            {
                debug!(%subject, "router draining, dropping registration");
                Ok(Applied::Frozen)
            }
            RegistryEvent::Register(reg) => {
                let (mut added, mut updated, mut refreshed) = (0, 0, 0);
                for uri in &reg.uris {
                    match self.table.upsert(uri, reg.record.clone()) {
                        UpsertOutcome::Added => added += 1,
                        UpsertOutcome::Updated => updated += 1,
                        UpsertOutcome::Refreshed => refreshed += 1,
                    }
                }
                Ok(Applied::Registered { added, updated, refreshed })
            }
            RegistryEvent::Unregister(reg) => {
                let removed = reg
                    .uris
                    .iter()
                    .filter(|uri| self.table.remove(uri, &reg.record.instance_id))
                    .count();
                Ok(Applied::Unregistered(removed))
            }
        }
    }
}
