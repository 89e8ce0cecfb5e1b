// In-process broker used by tests, the loopback demo and local runs.
//
// Behaves like a small MQTT broker: one live connection per client id,
// `+`/`#` subscription filters and a payload ceiling. Fault switches let
// tests reproduce refused or stalled connects, NACKs, lost acks and drops.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::link::{
    ConnectOptions, Connection, Connector, EVENT_QUEUE_DEPTH, Link, LinkError, LinkEvent,
};
use crate::{Delivery, Quality, topic};

/// Cheaply cloneable handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientEntry>,
    faults: Faults,
    max_payload_bytes: Option<usize>,
    published: Vec<Delivery>,
    publish_attempts: usize,
    connect_attempts: usize,
}

struct ClientEntry {
    connection: u64,
    events: mpsc::Sender<LinkEvent>,
    filters: Vec<String>,
}

#[derive(Default, Clone, Copy)]
struct Faults {
    refuse_connects: bool,
    stall_connects: bool,
    reject_publishes: bool,
    hold_acks: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // Publishes larger than this are NACKed, like a broker packet limit.
    pub fn with_max_payload_bytes(self, limit: usize) -> Self {
        self.inner.state.lock().max_payload_bytes = Some(limit);
        self
    }

    pub fn set_refuse_connects(&self, enabled: bool) {
        self.inner.state.lock().faults.refuse_connects = enabled;
    }

    // Connect attempts never complete while set.
    pub fn set_stall_connects(&self, enabled: bool) {
        self.inner.state.lock().faults.stall_connects = enabled;
    }

    pub fn set_reject_publishes(&self, enabled: bool) {
        self.inner.state.lock().faults.reject_publishes = enabled;
    }

    // Messages are still routed but at-least-once publishes never resolve.
    pub fn set_hold_acks(&self, enabled: bool) {
        self.inner.state.lock().faults.hold_acks = enabled;
    }

    /// Close a client's connection from the broker side.
    pub fn drop_client(&self, client_id: &str) -> bool {
        let entry = self.inner.state.lock().clients.remove(client_id);
        match entry {
            Some(entry) => {
                let _ = entry.events.try_send(LinkEvent::Closed(Some(
                    "connection dropped by broker".to_string(),
                )));
                tracing::debug!(client_id, "memory broker dropped client");
                true
            }
            None => false,
        }
    }

    /// Deliver a message as if an outside client had published it.
    pub async fn inject(&self, channel: &str, payload: Bytes) -> usize {
        self.inner
            .fanout(Delivery::new(channel, payload))
            .await
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.state.lock().clients.contains_key(client_id)
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .map(|entry| entry.filters.clone())
            .unwrap_or_default()
    }

    // Accepted publishes from connected clients, oldest first.
    pub fn published(&self) -> Vec<Delivery> {
        self.inner.state.lock().published.clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<Bytes> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|delivery| &*delivery.channel == channel)
            .map(|delivery| delivery.payload.clone())
            .collect()
    }

    // Every publish that reached the broker, accepted or not.
    pub fn publish_attempts(&self) -> usize {
        self.inner.state.lock().publish_attempts
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.state.lock().connect_attempts
    }
}

impl BrokerInner {
    async fn fanout(&self, delivery: Delivery) -> usize {
        // Collect senders under the lock, send after releasing it.
        let targets: Vec<mpsc::Sender<LinkEvent>> = {
            let state = self.state.lock();
            state
                .clients
                .values()
                .filter(|entry| {
                    entry
                        .filters
                        .iter()
                        .any(|filter| topic::matches(filter, &delivery.channel))
                })
                .map(|entry| entry.events.clone())
                .collect()
        };
        let mut delivered = 0;
        for events in targets {
            if events
                .send(LinkEvent::Message(delivery.clone()))
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn release(&self, client_id: &str, connection: u64) {
        let mut state = self.state.lock();
        if state
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.connection == connection)
        {
            state.clients.remove(client_id);
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Connection, LinkError> {
        let faults = {
            let mut state = self.inner.state.lock();
            state.connect_attempts += 1;
            state.faults
        };
        if faults.stall_connects {
            std::future::pending::<()>().await;
        }
        if faults.refuse_connects {
            return Err(LinkError::Refused("broker is refusing connections".to_string()));
        }

        let connection = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        {
            let mut state = self.inner.state.lock();
            if state.clients.contains_key(&options.client_id) {
                return Err(LinkError::Refused(format!(
                    "client id {} is already connected",
                    options.client_id
                )));
            }
            state.clients.insert(
                options.client_id.clone(),
                ClientEntry {
                    connection,
                    events: tx,
                    filters: Vec::new(),
                },
            );
        }
        tracing::debug!(client_id = %options.client_id, connection, "memory broker accepted client");
        Ok(Connection {
            link: Arc::new(MemoryLink {
                broker: self.inner.clone(),
                client_id: options.client_id.clone(),
                connection,
            }),
            events: rx,
        })
    }
}

struct MemoryLink {
    broker: Arc<BrokerInner>,
    client_id: String,
    connection: u64,
}

impl MemoryLink {
    fn with_entry<T>(&self, f: impl FnOnce(&mut ClientEntry) -> T) -> Result<T, LinkError> {
        let mut state = self.broker.state.lock();
        match state.clients.get_mut(&self.client_id) {
            Some(entry) if entry.connection == self.connection => Ok(f(entry)),
            _ => Err(LinkError::Closed),
        }
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        quality: Quality,
    ) -> Result<(), LinkError> {
        let hold_ack = {
            let mut state = self.broker.state.lock();
            state.publish_attempts += 1;
            if !state
                .clients
                .get(&self.client_id)
                .is_some_and(|entry| entry.connection == self.connection)
            {
                return Err(LinkError::Closed);
            }
            if state.faults.reject_publishes {
                return Err(LinkError::Rejected("publish refused by broker".to_string()));
            }
            if let Some(limit) = state.max_payload_bytes
                && payload.len() > limit
            {
                return Err(LinkError::Rejected(format!(
                    "payload of {} bytes exceeds broker limit of {limit}",
                    payload.len()
                )));
            }
            let delivery = Delivery::new(channel, payload.clone());
            state.published.push(delivery);
            state.faults.hold_acks
        };
        self.broker.fanout(Delivery::new(channel, payload)).await;
        if hold_ack && quality == Quality::AtLeastOnce {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _quality: Quality) -> Result<(), LinkError> {
        self.with_entry(|entry| {
            if !entry.filters.iter().any(|existing| existing == filter) {
                entry.filters.push(filter.to_string());
            }
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.with_entry(|entry| entry.filters.retain(|existing| existing != filter))
    }

    async fn close(&self) {
        self.broker.release(&self.client_id, self.connection);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.release(&self.client_id, self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Endpoint;

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions::new(client_id, Endpoint::new("memory", 0))
    }

    #[tokio::test]
    async fn routes_by_filter() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let mut sub = broker.connect(&options("sub")).await?;
        let publisher = broker.connect(&options("pub")).await?;
        sub.link.subscribe("device/+/response", Quality::AtLeastOnce).await?;
        publisher
            .link
            .publish(
                "device/image/response",
                Bytes::from_static(b"hit"),
                Quality::AtLeastOnce,
            )
            .await?;
        publisher
            .link
            .publish("device/image/request", Bytes::from_static(b"miss"), Quality::AtMostOnce)
            .await?;
        match sub.events.recv().await {
            Some(LinkEvent::Message(delivery)) => {
                assert_eq!(&*delivery.channel, "device/image/response");
                assert_eq!(delivery.payload, Bytes::from_static(b"hit"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sub.events.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.publish_attempts(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn payload_ceiling_nacks() -> anyhow::Result<()> {
        let broker = MemoryBroker::new().with_max_payload_bytes(4);
        let client = broker.connect(&options("pub")).await?;
        let err = client
            .link
            .publish("a", Bytes::from_static(b"12345"), Quality::AtLeastOnce)
            .await
            .expect_err("too big");
        assert!(matches!(err, LinkError::Rejected(_)));
        assert!(broker.published().is_empty());
        assert_eq!(broker.publish_attempts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_client_gets_closed_event_and_dead_link() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let mut client = broker.connect(&options("cam")).await?;
        assert!(broker.drop_client("cam"));
        assert!(!broker.drop_client("cam"));
        assert!(matches!(client.events.recv().await, Some(LinkEvent::Closed(_))));
        let err = client
            .link
            .publish("a", Bytes::new(), Quality::AtMostOnce)
            .await
            .expect_err("closed");
        assert_eq!(err, LinkError::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn identity_is_freed_when_link_is_released() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let first = broker.connect(&options("cam")).await?;
        assert!(broker.connect(&options("cam")).await.is_err());
        first.link.close().await;
        assert!(!broker.is_connected("cam"));
        let second = broker.connect(&options("cam")).await?;
        // The stale link must not evict the new connection.
        drop(first);
        assert!(broker.is_connected("cam"));
        drop(second);
        assert!(!broker.is_connected("cam"));
        Ok(())
    }
}
