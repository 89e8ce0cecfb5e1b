// Request-side client: encode a payload and publish it on the request channel.
use courier_transport::{Quality, Session};
use courier_wire::{Codec, CorrelationId, Envelope, Metadata};
use serde_json::Value;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::correlation::Correlator;
use crate::error::{Error, Result};

pub const FIELD_DEVICE_ID: &str = "device_id";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Publishes request envelopes on one fixed channel.
#[derive(Clone)]
pub struct Publisher {
    session: Session,
    channel: String,
    codec: Codec,
    correlator: Option<Correlator>,
    metadata: Metadata,
    device_id: Option<String>,
}

/// A request encoded ahead of publishing. The envelope is exactly the bytes
/// [`Publisher::send_prepared`] puts on the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    correlation_id: CorrelationId,
    envelope: Envelope,
    payload_bytes: usize,
}

impl PreparedRequest {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

impl Publisher {
    pub fn new(session: Session, channel: impl Into<String>, codec: Codec) -> Self {
        Self {
            session,
            channel: channel.into(),
            codec,
            correlator: None,
            metadata: Metadata::new(),
            device_id: None,
        }
    }

    pub fn with_correlator(mut self, correlator: Correlator) -> Self {
        self.correlator = Some(correlator);
        self
    }

    // Static fields added to every request envelope.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Device identity stamped on requests. Without it the session's client
    /// id is used, which is only known once connected.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Encode and publish `payload`, returning the token the response will
    /// echo. Nothing is retried; the error kind is the one that occurred.
    pub async fn send(&self, payload: &[u8], quality: Quality) -> Result<CorrelationId> {
        let request = self.prepare(payload)?;
        self.send_prepared(request, quality).await
    }

    /// Encode `payload` into its final envelope without touching the
    /// session. Size and encoding errors surface here, before any
    /// connection exists.
    pub fn prepare(&self, payload: &[u8]) -> Result<PreparedRequest> {
        let correlation_id = CorrelationId::new();
        let envelope =
            self.codec
                .encode_request(payload, Some(correlation_id), self.request_metadata())?;
        Ok(PreparedRequest {
            correlation_id,
            envelope,
            payload_bytes: payload.len(),
        })
    }

    pub async fn send_prepared(
        &self,
        request: PreparedRequest,
        quality: Quality,
    ) -> Result<CorrelationId> {
        let PreparedRequest {
            correlation_id: id,
            envelope,
            payload_bytes,
        } = request;
        let envelope_bytes = envelope.len();

        if let Some(correlator) = &self.correlator {
            correlator.register(id);
        }
        if let Err(err) = self
            .session
            .publish(&self.channel, envelope.into_bytes(), quality)
            .await
        {
            // A timed-out publish may still have been delivered.
            if !matches!(err, courier_transport::Error::PublishTimeout(_))
                && let Some(correlator) = &self.correlator
            {
                correlator.withdraw(id);
            }
            tracing::warn!(channel = %self.channel, correlation_id = %id, error = %err, "request publish failed");
            return Err(err.into());
        }

        metrics::counter!("courier_requests_sent_total").increment(1);
        tracing::info!(
            channel = %self.channel,
            correlation_id = %id,
            payload_bytes,
            envelope_bytes,
            "request sent"
        );
        Ok(id)
    }

    pub async fn send_file(&self, path: impl AsRef<Path>, quality: Quality) -> Result<CorrelationId> {
        let path = path.as_ref();
        let payload = tokio::fs::read(path).await.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.send(&payload, quality).await
    }

    fn request_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        if let Some(device_id) = self.device_id.clone().or_else(|| self.session.client_id()) {
            metadata.insert(FIELD_DEVICE_ID.to_string(), Value::String(device_id));
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        metadata.insert(FIELD_TIMESTAMP.to_string(), Value::from(timestamp));
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use courier_transport::{ConnectOptions, Endpoint, MemoryBroker, SessionConfig};
    use std::sync::Arc;
    use std::time::Duration;

    async fn connected(broker: &MemoryBroker, client_id: &str) -> Session {
        let session = Session::new(
            Arc::new(broker.clone()),
            SessionConfig {
                ack_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
        );
        session
            .connect(ConnectOptions::new(client_id, Endpoint::new("memory", 0)))
            .await
            .expect("connect");
        session
    }

    #[tokio::test]
    async fn request_carries_device_metadata() {
        let broker = MemoryBroker::new();
        let session = connected(&broker, "cam-7").await;
        let publisher = Publisher::new(session, "device/image/request", Codec::default())
            .with_metadata("site", "lab");
        let id = publisher
            .send(b"pixels", Quality::AtLeastOnce)
            .await
            .expect("send");

        let sent = broker.published_on("device/image/request");
        assert_eq!(sent.len(), 1);
        let request = Codec::default().decode_request(&sent[0]).expect("decode");
        assert_eq!(request.payload.as_ref(), b"pixels");
        assert_eq!(request.correlation_id, Some(id));
        assert_eq!(request.metadata.get("device_id"), Some(&Value::from("cam-7")));
        assert_eq!(request.metadata.get("site"), Some(&Value::from("lab")));
        assert!(request.metadata.get("timestamp").is_some_and(Value::is_f64));
    }

    #[tokio::test]
    async fn rejected_publish_withdraws_the_token() {
        let broker = MemoryBroker::new();
        let session = connected(&broker, "cam").await;
        let correlator = Correlator::new(Duration::from_secs(60));
        let publisher = Publisher::new(session, "req", Codec::default())
            .with_correlator(correlator.clone());
        broker.set_reject_publishes(true);
        let err = publisher
            .send(b"x", Quality::AtLeastOnce)
            .await
            .expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::PublishRejected);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn timed_out_publish_keeps_the_token() {
        let broker = MemoryBroker::new();
        let session = connected(&broker, "cam").await;
        let correlator = Correlator::new(Duration::from_secs(60));
        let publisher = Publisher::new(session, "req", Codec::default())
            .with_correlator(correlator.clone());
        broker.set_hold_acks(true);
        let err = publisher
            .send(b"x", Quality::AtLeastOnce)
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::PublishTimeout);
        assert_eq!(correlator.outstanding(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let broker = MemoryBroker::new();
        let session = connected(&broker, "cam").await;
        let publisher = Publisher::new(session, "req", Codec::default());
        let err = publisher
            .send_file("/nonexistent/courier/image.png", Quality::AtLeastOnce)
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn send_file_publishes_file_contents() {
        let broker = MemoryBroker::new();
        let session = connected(&broker, "cam").await;
        let publisher = Publisher::new(session, "req", Codec::default());
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), b"\x89PNG\r\n").expect("write");
        publisher
            .send_file(file.path(), Quality::AtMostOnce)
            .await
            .expect("send");
        let request = Codec::default()
            .decode_request(&broker.published_on("req")[0])
            .expect("decode");
        assert_eq!(request.payload.as_ref(), b"\x89PNG\r\n");
    }

    #[tokio::test]
    async fn prepare_sizes_the_envelope_send_will_publish() {
        let broker = MemoryBroker::new();
        let session = Session::new(Arc::new(broker.clone()), SessionConfig::default());
        let payload = vec![7u8; 3000];
        // Room for the bare envelope but not for the device metadata.
        let bare = Codec::default()
            .encode_request(&payload, Some(CorrelationId::new()), Metadata::new())
            .expect("bare envelope");
        let codec = Codec::new(bare.len() + 10);
        let publisher = Publisher::new(session.clone(), "req", codec).with_device_id("cam-7");

        let err = publisher.prepare(&payload).expect_err("metadata pushes it over");
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert_eq!(broker.connect_attempts(), 0);
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn prepared_request_is_published_unchanged() {
        let broker = MemoryBroker::new();
        let session = Session::new(Arc::new(broker.clone()), SessionConfig::default());
        let publisher =
            Publisher::new(session.clone(), "req", Codec::default()).with_device_id("cam-7");
        let request = publisher.prepare(b"pixels").expect("prepare");
        let expected = request.envelope().clone();

        session
            .connect(ConnectOptions::new("cam-7", Endpoint::new("memory", 0)))
            .await
            .expect("connect");
        let id = publisher
            .send_prepared(request, Quality::AtLeastOnce)
            .await
            .expect("send");
        let sent = broker.published_on("req");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_ref(), expected.as_bytes());
        let decoded = Codec::default().decode_request(&sent[0]).expect("decode");
        assert_eq!(decoded.correlation_id, Some(id));
        assert_eq!(decoded.metadata.get("device_id"), Some(&Value::from("cam-7")));
    }
}
