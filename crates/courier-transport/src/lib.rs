// Pub/sub transport session for courier.
//
// A `Session` owns one logical connection to a broker, the connection state
// machine and the subscription registry. The broker itself sits behind the
// `Connector`/`Link` traits so the same session drives the in-memory broker
// used by tests and the MQTT link used in the field.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod backoff;
pub mod link;
pub mod memory;
pub mod mqtt;
mod session;
pub mod topic;

pub use backoff::{Backoff, ReconnectPolicy};
pub use link::{
    ConnectOptions, Connection, Connector, Credentials, Endpoint, Link, LinkError, LinkEvent,
};
pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;
pub use session::{Handler, Session, SessionConfig};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("session is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("no publish acknowledgement within {0:?}")]
    PublishTimeout(Duration),
    #[error("subscribe rejected: {0}")]
    SubscribeRejected(String),
    #[error("invalid channel {channel:?}: {reason}")]
    InvalidChannel {
        channel: String,
        reason: &'static str,
    },
}

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::AtMostOnce => "at_most_once",
            Quality::AtLeastOnce => "at_least_once",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "0" | "at_most_once" | "at-most-once" => Some(Quality::AtMostOnce),
            "1" | "at_least_once" | "at-least-once" => Some(Quality::AtLeastOnce),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Inbound message handed to subscription handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Arc<str>,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(channel: impl Into<Arc<str>>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}
