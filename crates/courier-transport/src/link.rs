// Broker link abstraction.
//
// A `Connector` opens one connection for a client identity and hands back the
// `Link` used to talk to the broker plus a queue of inbound events. The
// session never retries inside a connector; reconnect policy lives above it.
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{Delivery, Quality};

pub(crate) const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Paths to PEM material. The session treats them as opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl Credentials {
    /// Reject combinations that cannot produce the TLS session they imply:
    /// a client certificate without its key (or the reverse), or client
    /// material without a CA to enable TLS at all.
    pub fn check(&self) -> Result<(), &'static str> {
        match (&self.cert, &self.key) {
            (Some(_), None) => return Err("client certificate given without a private key"),
            (None, Some(_)) => return Err("private key given without a client certificate"),
            _ => {}
        }
        if self.ca.is_none() && self.cert.is_some() {
            return Err("client certificate and key require a CA certificate");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub keep_alive: Duration,
    pub max_packet_bytes: usize,
    pub proxy: Option<Endpoint>,
    pub clean_session: bool,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint,
            credentials: Credentials::default(),
            keep_alive: Duration::from_secs(60),
            max_packet_bytes: 256 * 1024,
            proxy: None,
            clean_session: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(Delivery),
    // Broker-side close; carries the reason when one is known.
    Closed(Option<String>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

pub struct Connection {
    pub link: Arc<dyn Link>,
    pub events: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Connection, LinkError>;
}

#[async_trait]
pub trait Link: Send + Sync {
    /// At-least-once resolves on the broker acknowledgement, at-most-once
    /// once the message has been handed to the connection.
    async fn publish(&self, channel: &str, payload: Bytes, quality: Quality)
    -> Result<(), LinkError>;

    async fn subscribe(&self, filter: &str, quality: Quality) -> Result<(), LinkError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), LinkError>;

    // Client-initiated close. Does not emit `LinkEvent::Closed`.
    async fn close(&self);
}
