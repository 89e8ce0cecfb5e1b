// MQTT 3.1.1 link over TCP or TLS, backed by rumqttc.
//
// rumqttc assigns packet ids inside its event loop, so a single writer task
// owns the client and queues one waiter per request in submission order. The
// event task pairs each outgoing packet id with the next waiter and resolves
// it when the matching PUBACK/SUBACK arrives. rumqttc's own reconnect is not
// used: the first connection error closes the link and the session decides.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Proxy, ProxyAuth, ProxyType, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::link::{
    ConnectOptions, Connection, Connector, EVENT_QUEUE_DEPTH, Link, LinkError, LinkEvent,
};
use crate::{Delivery, Quality};

const COMMAND_QUEUE_DEPTH: usize = 256;
const DEFAULT_REQUEST_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Ack = oneshot::Sender<Result<(), LinkError>>;

/// Opens MQTT connections with rumqttc.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    // Bound on requests queued between the client and its event loop.
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Connection, LinkError> {
        let mqtt_options = build_options(options).await?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);
        wait_for_connack(&mut eventloop).await?;
        tracing::debug!(
            client_id = %options.client_id,
            host = %options.endpoint.host,
            port = options.endpoint.port,
            "mqtt connack received"
        );

        let pending = Arc::new(Mutex::new(Pending::default()));
        let closing = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let event_task = tokio::spawn(run_events(
            eventloop,
            pending.clone(),
            events_tx,
            closing.clone(),
        ));
        tokio::spawn(run_writer(client, pending, commands_rx));

        Ok(Connection {
            link: Arc::new(MqttLink {
                commands: commands_tx,
                closing,
                event_task: Mutex::new(Some(event_task)),
                max_packet_bytes: options.max_packet_bytes,
            }),
            events: events_rx,
        })
    }
}

async fn build_options(options: &ConnectOptions) -> Result<MqttOptions, LinkError> {
    let mut mqtt = MqttOptions::new(
        options.client_id.clone(),
        options.endpoint.host.clone(),
        options.endpoint.port,
    );
    // rumqttc rejects keep-alives below one second other than zero.
    let keep_alive = if options.keep_alive.is_zero() {
        options.keep_alive
    } else {
        options.keep_alive.max(Duration::from_secs(1))
    };
    mqtt.set_keep_alive(keep_alive);
    mqtt.set_clean_session(options.clean_session);
    mqtt.set_max_packet_size(options.max_packet_bytes, options.max_packet_bytes);

    let credentials = &options.credentials;
    credentials
        .check()
        .map_err(|reason| LinkError::Refused(reason.to_string()))?;
    if let Some(ca_path) = &credentials.ca {
        let ca = tokio::fs::read(ca_path).await?;
        let client_auth = match (&credentials.cert, &credentials.key) {
            (Some(cert), Some(key)) => {
                Some((tokio::fs::read(cert).await?, tokio::fs::read(key).await?))
            }
            _ => None,
        };
        mqtt.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }
    if let Some(proxy) = &options.proxy {
        mqtt.set_proxy(Proxy {
            ty: ProxyType::Http,
            auth: ProxyAuth::None,
            addr: proxy.host.clone(),
            port: proxy.port,
        });
    }
    Ok(mqtt)
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(LinkError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(LinkError::Refused(format!("{code:?}")));
            }
            Err(ConnectionError::Io(err)) => return Err(err.into()),
            Err(err) => return Err(LinkError::Refused(err.to_string())),
        }
    }
}

fn qos(quality: Quality) -> QoS {
    match quality {
        Quality::AtMostOnce => QoS::AtMostOnce,
        Quality::AtLeastOnce => QoS::AtLeastOnce,
    }
}

// Size of a PUBLISH packet without the fixed header.
fn publish_packet_len(channel: &str, payload_len: usize, quality: Quality) -> usize {
    let packet_id = match quality {
        Quality::AtMostOnce => 0,
        Quality::AtLeastOnce => 2,
    };
    2 + channel.len() + packet_id + payload_len
}

enum Command {
    Publish {
        channel: String,
        payload: Bytes,
        quality: Quality,
        done: Ack,
    },
    Subscribe {
        filter: String,
        quality: Quality,
        done: Ack,
    },
    Unsubscribe {
        filter: String,
        done: Ack,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Pending {
    // Waiting for rumqttc to assign a packet id, in submission order.
    publishes: VecDeque<(Quality, Ack)>,
    subscribes: VecDeque<Ack>,
    // Waiting for the broker, keyed by packet id.
    pubacks: HashMap<u16, Ack>,
    subacks: HashMap<u16, Ack>,
}

impl Pending {
    fn on_outgoing_publish(&mut self, pkid: u16) {
        let Some((quality, done)) = self.publishes.pop_front() else {
            return;
        };
        match quality {
            Quality::AtMostOnce => {
                let _ = done.send(Ok(()));
            }
            Quality::AtLeastOnce => {
                self.pubacks.insert(pkid, done);
            }
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(done) = self.pubacks.remove(&pkid) {
            let _ = done.send(Ok(()));
        }
    }

    fn on_outgoing_subscribe(&mut self, pkid: u16) {
        if let Some(done) = self.subscribes.pop_front() {
            self.subacks.insert(pkid, done);
        }
    }

    fn on_suback(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) {
        if let Some(done) = self.subacks.remove(&pkid) {
            let result = if codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                Err(LinkError::Rejected("subscription refused".to_string()))
            } else {
                Ok(())
            };
            let _ = done.send(result);
        }
    }

    // Dropping the senders resolves every waiter as closed.
    fn clear(&mut self) {
        self.publishes.clear();
        self.subscribes.clear();
        self.pubacks.clear();
        self.subacks.clear();
    }
}

async fn run_writer(
    client: AsyncClient,
    pending: Arc<Mutex<Pending>>,
    mut commands: mpsc::Receiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Publish {
                channel,
                payload,
                quality,
                done,
            } => {
                pending.lock().publishes.push_back((quality, done));
                if let Err(err) = client
                    .publish_bytes(channel, qos(quality), false, payload)
                    .await
                {
                    tracing::debug!(error = %err, "mqtt publish request failed");
                    if let Some((_, done)) = pending.lock().publishes.pop_back() {
                        let _ = done.send(Err(LinkError::Closed));
                    }
                }
            }
            Command::Subscribe {
                filter,
                quality,
                done,
            } => {
                pending.lock().subscribes.push_back(done);
                if let Err(err) = client.subscribe(filter, qos(quality)).await {
                    tracing::debug!(error = %err, "mqtt subscribe request failed");
                    if let Some(done) = pending.lock().subscribes.pop_back() {
                        let _ = done.send(Err(LinkError::Closed));
                    }
                }
            }
            Command::Unsubscribe { filter, done } => {
                let result = client
                    .unsubscribe(filter)
                    .await
                    .map_err(|_| LinkError::Closed);
                let _ = done.send(result);
            }
            Command::Close { done } => {
                let _ = client.disconnect().await;
                let _ = done.send(());
                break;
            }
        }
    }
}

async fn run_events(
    mut eventloop: EventLoop,
    pending: Arc<Mutex<Pending>>,
    events: mpsc::Sender<LinkEvent>,
    closing: Arc<AtomicBool>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivery = Delivery::new(publish.topic.as_str(), publish.payload);
                if events.send(LinkEvent::Message(delivery)).await.is_err() {
                    break None;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => pending.lock().on_puback(ack.pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                pending.lock().on_suback(ack.pkid, &ack.return_codes)
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                break Some("broker sent disconnect".to_string());
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                pending.lock().on_outgoing_publish(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                pending.lock().on_outgoing_subscribe(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break None,
            Ok(_) => {}
            Err(err) => break Some(err.to_string()),
        }
    };
    pending.lock().clear();
    if closing.load(Ordering::SeqCst) {
        return;
    }
    tracing::debug!(reason = reason.as_deref().unwrap_or("event queue closed"), "mqtt link closed");
    let _ = events.send(LinkEvent::Closed(reason)).await;
}

struct MqttLink {
    commands: mpsc::Sender<Command>,
    closing: Arc<AtomicBool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    max_packet_bytes: usize,
}

impl MqttLink {
    async fn request<F>(&self, build: F) -> Result<(), LinkError>
    where
        F: FnOnce(Ack) -> Command,
    {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(build(done))
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        quality: Quality,
    ) -> Result<(), LinkError> {
        let size = publish_packet_len(channel, payload.len(), quality);
        if size > self.max_packet_bytes {
            return Err(LinkError::Rejected(format!(
                "packet of {size} bytes exceeds limit of {}",
                self.max_packet_bytes
            )));
        }
        let channel = channel.to_string();
        self.request(move |done| Command::Publish {
            channel,
            payload,
            quality,
            done,
        })
        .await
    }

    async fn subscribe(&self, filter: &str, quality: Quality) -> Result<(), LinkError> {
        let filter = filter.to_string();
        self.request(move |done| Command::Subscribe {
            filter,
            quality,
            done,
        })
        .await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        let filter = filter.to_string();
        self.request(move |done| Command::Unsubscribe { filter, done })
            .await
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, rx).await;
        }
        let task = self.event_task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Credentials, Endpoint};
    use std::io::Write;

    fn options() -> ConnectOptions {
        ConnectOptions::new("basicPubSub", Endpoint::new("broker.local", 8883))
    }

    #[tokio::test]
    async fn options_carry_identity_and_keep_alive() {
        let mut options = options();
        options.keep_alive = Duration::from_millis(10);
        options.clean_session = false;
        let mqtt = build_options(&options).await.expect("options");
        assert_eq!(mqtt.client_id(), "basicPubSub");
        assert_eq!(mqtt.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(1));
        assert!(!mqtt.clean_session());
    }

    #[tokio::test]
    async fn missing_ca_file_is_io_error() {
        let mut options = options();
        options.credentials = Credentials {
            ca: Some("/nonexistent/courier/ca.pem".into()),
            ..Credentials::default()
        };
        let err = build_options(&options).await.expect_err("missing ca");
        assert!(matches!(err, LinkError::Io(_)));
    }

    #[tokio::test]
    async fn client_material_without_ca_is_refused() {
        let mut options = options();
        options.credentials = Credentials {
            ca: None,
            cert: Some("/etc/courier/device.pem.crt".into()),
            key: Some("/etc/courier/device.private.key".into()),
        };
        let err = build_options(&options).await.expect_err("no ca");
        assert!(matches!(err, LinkError::Refused(_)));
    }

    #[tokio::test]
    async fn certificate_without_key_is_refused() {
        let mut ca = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(ca, "-----BEGIN CERTIFICATE-----").expect("write");
        let mut options = options();
        options.credentials = Credentials {
            ca: Some(ca.path().to_path_buf()),
            cert: Some("/etc/courier/device.pem.crt".into()),
            key: None,
        };
        let err = build_options(&options).await.expect_err("no key");
        assert!(matches!(err, LinkError::Refused(_)));
    }

    #[tokio::test]
    async fn readable_ca_enables_tls() {
        let mut ca = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(ca, "-----BEGIN CERTIFICATE-----").expect("write");
        let mut options = options();
        options.credentials.ca = Some(ca.path().to_path_buf());
        let mqtt = build_options(&options).await.expect("options");
        assert!(matches!(mqtt.transport(), Transport::Tls(_)));
    }

    #[test]
    fn packet_length_counts_topic_and_packet_id() {
        assert_eq!(publish_packet_len("a/b", 10, Quality::AtMostOnce), 15);
        assert_eq!(publish_packet_len("a/b", 10, Quality::AtLeastOnce), 17);
    }

    #[tokio::test]
    async fn acks_resolve_in_packet_id_order() {
        let mut pending = Pending::default();
        let (first, mut first_rx) = oneshot::channel();
        let (second, mut second_rx) = oneshot::channel();
        let (third, third_rx) = oneshot::channel();
        pending.publishes.push_back((Quality::AtLeastOnce, first));
        pending.publishes.push_back((Quality::AtMostOnce, second));
        pending.publishes.push_back((Quality::AtLeastOnce, third));

        pending.on_outgoing_publish(7);
        pending.on_outgoing_publish(0);
        pending.on_outgoing_publish(8);
        assert_eq!(second_rx.try_recv().expect("qos0 resolved"), Ok(()));
        assert!(first_rx.try_recv().is_err());

        pending.on_puback(8);
        assert_eq!(third_rx.await.expect("resolved"), Ok(()));
        pending.clear();
        assert!(first_rx.await.is_err());
    }

    #[tokio::test]
    async fn failed_suback_rejects_subscribe() {
        let mut pending = Pending::default();
        let (done, rx) = oneshot::channel();
        pending.subscribes.push_back(done);
        pending.on_outgoing_subscribe(3);
        pending.on_suback(3, &[SubscribeReasonCode::Failure]);
        assert!(matches!(rx.await.expect("resolved"), Err(LinkError::Rejected(_))));
    }
}
