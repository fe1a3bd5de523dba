//! NATS connection and subscription loop.
//!
//! The client reconnects forever with capped exponential backoff. While
//! disconnected the route table keeps serving what it has; `BusHealth`
//! is cleared so the pruner can suspend, and set again on reconnect,
//! when the router also re-announces itself on `router.start`.

use std::sync::Arc;

use async_nats::{Client, ConnectOptions, Event, Message};
use futures_util::StreamExt;
use futures_util::stream::select_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchyard_core::{DrainState, Lifecycle, RouterConfig, RouterStart, Subject};
use switchyard_registry::BusHealth;

use crate::backoff::ReconnectBackoff;
use crate::error::{BusError, BusResult};
use crate::handler::RegistryHandler;

/// Build this router's announcement from its config.
pub fn router_start(config: &RouterConfig, hosts: Vec<String>) -> BusResult<RouterStart> {
    let mut id = [0u8; 16];
    getrandom::getrandom(&mut id).map_err(|e| BusError::Random(e.to_string()))?;
    Ok(RouterStart {
        id: hex::encode(id),
        hosts,
        minimum_register_interval_secs: config.start_response_delay_interval.as_secs(),
        prune_threshold_secs: config.droplet_stale_threshold.as_secs(),
    })
}

pub struct BusListener {
    servers: Vec<String>,
    handler: Arc<RegistryHandler>,
    bus: BusHealth,
    lifecycle: Lifecycle,
    backoff: ReconnectBackoff,
}

impl BusListener {
    pub fn new(
        servers: Vec<String>,
        handler: RegistryHandler,
        bus: BusHealth,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            servers,
            handler: Arc::new(handler),
            bus,
            lifecycle,
            backoff: ReconnectBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Connect, subscribe and process messages until the router stops.
    ///
    /// Only setup failures are returned; runtime disconnects are retried.
    pub async fn run(self) -> BusResult<()> {
        if self.servers.is_empty() {
            return Err(BusError::NoServers);
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let backoff = self.backoff;
        let client = ConnectOptions::new()
            .name("switchyard")
            .retry_on_initial_connect()
            .max_reconnects(None::<usize>)
            .reconnect_delay_callback(move |attempts| backoff.delay(attempts))
            .event_callback(move |event| {
                let tx = events_tx.clone();
                async move {
                    let _ = tx.send(event);
                }
            })
            .connect(self.servers.join(","))
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let mut subscriptions = Vec::with_capacity(Subject::ALL.len());
        for subject in Subject::ALL {
            let sub = client
                .subscribe(subject.as_str())
                .await
                .map_err(|e| BusError::Subscribe {
                    subject: subject.to_string(),
                    reason: e.to_string(),
                })?;
            subscriptions.push(sub);
        }
        let mut messages = select_all(subscriptions);
        let mut lifecycle = self.lifecycle.subscribe();

        info!(servers = self.servers.len(), "bus listener subscribed");

        loop {
            tokio::select! {
                msg = messages.next() => match msg {
                    Some(msg) => self.dispatch(&client, msg).await,
                    None => {
                        warn!("bus subscriptions closed");
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(&client, event).await,
                changed = lifecycle.changed() => {
                    if changed.is_err() || *lifecycle.borrow() == DrainState::Stopped {
                        break;
                    }
                }
            }
        }

        self.bus.set_available(false);
        debug!("bus listener stopped");
        Ok(())
    }

    async fn dispatch(&self, client: &Client, msg: Message) {
        match self.handler.handle(&msg.subject, &msg.payload) {
            Ok(applied) => {
                debug!(subject = %msg.subject, ?applied, "bus message applied");
                if let (Some(reply), Some(payload)) = (msg.reply, applied.reply()) {
                    if let Err(e) = client.publish(reply, payload.clone()).await {
                        warn!(error = %e, "failed to answer greet");
                    }
                }
            }
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "dropping malformed bus message");
            }
        }
    }

    async fn on_event(&self, client: &Client, event: Event) {
        if track_connection(&self.bus, &event) {
            self.announce(client).await;
        }
    }

    async fn announce(&self, client: &Client) {
        if let Err(e) = client
            .publish(Subject::START, self.handler.start_payload())
            .await
        {
            warn!(error = %e, "failed to publish router.start");
        }
    }
}

/// Mirror a connection event into `bus`. Returns true when the client
/// has just (re)connected and the router should announce itself.
fn track_connection(bus: &BusHealth, event: &Event) -> bool {
    match event {
        Event::Connected => {
            bus.set_available(true);
            info!("connected to NATS");
            true
        }
        Event::Disconnected => {
            bus.set_available(false);
            warn!("disconnected from NATS, serving existing routes");
            false
        }
        other => {
            debug!(event = %other, "nats event");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_registry::RouteTable;

    #[test]
    fn router_start_carries_intervals() {
        let config = RouterConfig {
            start_response_delay_interval: Duration::from_secs(7),
            droplet_stale_threshold: Duration::from_secs(90),
            ..RouterConfig::default()
        };
        let start = router_start(&config, vec!["10.0.0.5".to_string()]).unwrap();
        assert_eq!(start.id.len(), 32);
        assert_eq!(start.minimum_register_interval_secs, 7);
        assert_eq!(start.prune_threshold_secs, 90);
    }

    #[test]
    fn router_ids_are_unique() {
        let config = RouterConfig::default();
        let a = router_start(&config, vec![]).unwrap();
        let b = router_start(&config, vec![]).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn run_without_servers_fails_fast() {
        let config = RouterConfig::default();
        let table = Arc::new(RouteTable::new(Duration::from_secs(120)));
        let lifecycle = Lifecycle::new();
        let handler = RegistryHandler::new(table, lifecycle.clone(), &router_start(&config, vec![]).unwrap());
        let listener = BusListener::new(vec![], handler, BusHealth::new(false), lifecycle);
        assert!(matches!(listener.run().await, Err(BusError::NoServers)));
    }

    #[test]
    fn connection_events_drive_bus_health() {
        let bus = BusHealth::new(false);

        assert!(track_connection(&bus, &Event::Connected));
        assert!(bus.is_available());

        assert!(!track_connection(&bus, &Event::LameDuckMode));
        assert!(bus.is_available());

        assert!(!track_connection(&bus, &Event::Disconnected));
        assert!(!bus.is_available());

        // Reconnect announces again.
        assert!(track_connection(&bus, &Event::Connected));
        assert!(bus.is_available());
    }
}
