// Session state machine, subscription registry and dispatch task.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backoff::ReconnectPolicy;
use crate::link::{ConnectOptions, Connection, Connector, Link, LinkError, LinkEvent};
use crate::topic;
use crate::{ConnectionState, Delivery, Error, Quality, Result};

/// Callback invoked on the dispatch task for each inbound message.
pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub subscribe_quality: Quality,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            subscribe_quality: Quality::AtLeastOnce,
        }
    }
}

/// Shared handle to one logical broker connection.
///
/// Clones share the same connection, state and registry. The connection
/// state is only changed by the session itself; callers observe it through
/// [`Session::state`] or [`Session::watch_state`].
///
/// ```
/// use bytes::Bytes;
/// use courier_transport::{
///     ConnectOptions, Endpoint, MemoryBroker, Quality, Session, SessionConfig,
/// };
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = MemoryBroker::new();
///     let session = Session::new(Arc::new(broker.clone()), SessionConfig::default());
///     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
///     session
///         .connect(ConnectOptions::new("cam-1", Endpoint::new("localhost", 1883)))
///         .await
///         .expect("connect");
///     session
///         .subscribe("updates", move |delivery| {
///             let _ = tx.send(delivery.payload);
///         })
///         .await
///         .expect("subscribe");
///     session
///         .publish("updates", Bytes::from_static(b"payload"), Quality::AtLeastOnce)
///         .await
///         .expect("publish");
///     assert_eq!(rx.recv().await.expect("recv"), Bytes::from_static(b"payload"));
///     session.disconnect().await;
/// });
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    // Serializes connect, disconnect and reconnect installs.
    lifecycle: tokio::sync::Mutex<()>,
    link: Mutex<Option<Arc<dyn Link>>>,
    registry: Mutex<HashMap<String, Handler>>,
    options: Mutex<Option<ConnectOptions>>,
    // Bumped by every explicit connect/disconnect so a stale dispatch task
    // can tell that it no longer owns the connection.
    epoch: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                connector,
                config,
                state,
                lifecycle: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                registry: Mutex::new(HashMap::new()),
                options: Mutex::new(None),
                epoch: AtomicU64::new(0),
                dispatch: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner
            .options
            .lock()
            .as_ref()
            .map(|options| options.client_id.clone())
    }

    // Registered channels, sorted for stable output.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.registry.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Open the connection. Fails fast; retries only happen after a
    /// broker-initiated drop of an established connection.
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if self.state() == ConnectionState::Connected {
            let current = inner.options.lock().clone();
            return match current {
                Some(current) if current.client_id == options.client_id => Ok(()),
                Some(current) => Err(Error::Connect(format!(
                    "session already connected as {}",
                    current.client_id
                ))),
                None => Err(Error::Connect("session state is inconsistent".to_string())),
            };
        }

        // An explicit connect supersedes a reconnect loop still in flight.
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = inner.dispatch.lock().take() {
            handle.abort();
        }
        inner.link.lock().take();
        inner.set_state(ConnectionState::Connecting);

        let timeout = inner.config.connect_timeout;
        let connection =
            match tokio::time::timeout(timeout, inner.connector.connect(&options)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    inner.set_state(ConnectionState::Disconnected);
                    tracing::warn!(client_id = %options.client_id, error = %err, "connect failed");
                    return Err(Error::Connect(err.to_string()));
                }
                Err(_) => {
                    inner.set_state(ConnectionState::Disconnected);
                    tracing::warn!(client_id = %options.client_id, ?timeout, "connect timed out");
                    return Err(Error::ConnectTimeout(timeout));
                }
            };

        // Channels kept from an exhausted reconnect are restored here.
        if let Err(err) = inner.resubscribe(connection.link.as_ref()).await {
            connection.link.close().await;
            inner.set_state(ConnectionState::Disconnected);
            return Err(Error::SubscribeRejected(err.to_string()));
        }

        tracing::info!(
            client_id = %options.client_id,
            host = %options.endpoint.host,
            port = options.endpoint.port,
            "session connected"
        );
        *inner.options.lock() = Some(options);
        inner.install(connection, epoch);
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: Bytes, quality: Quality) -> Result<()> {
        let link = self.inner.current_link().ok_or(Error::NotConnected)?;
        topic::validate_channel(channel)?;
        let size = payload.len();
        match quality {
            Quality::AtMostOnce => link
                .publish(channel, payload, quality)
                .await
                .map_err(publish_error)?,
            Quality::AtLeastOnce => {
                let timeout = self.inner.config.ack_timeout;
                match tokio::time::timeout(timeout, link.publish(channel, payload, quality)).await
                {
                    Ok(result) => result.map_err(publish_error)?,
                    Err(_) => {
                        tracing::warn!(channel, ?timeout, "publish acknowledgement timed out");
                        return Err(Error::PublishTimeout(timeout));
                    }
                }
            }
        }
        metrics::counter!("courier_session_publishes_total").increment(1);
        tracing::debug!(channel, size, %quality, "published");
        Ok(())
    }

    /// Register `handler` for `channel`. Last registration wins.
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let link = self.inner.current_link().ok_or(Error::NotConnected)?;
        topic::validate_filter(channel)?;
        let handler: Handler = Arc::new(handler);
        let previous = self
            .inner
            .registry
            .lock()
            .insert(channel.to_string(), handler);
        if previous.is_some() {
            tracing::debug!(channel, "replaced subscription handler");
            return Ok(());
        }
        if let Err(err) = link
            .subscribe(channel, self.inner.config.subscribe_quality)
            .await
        {
            self.inner.registry.lock().remove(channel);
            tracing::warn!(channel, error = %err, "subscribe failed");
            return Err(match err {
                LinkError::Closed => Error::NotConnected,
                other => Error::SubscribeRejected(other.to_string()),
            });
        }
        tracing::debug!(channel, "subscribed");
        Ok(())
    }

    /// Drop the handler for `channel`. Returns false when none was registered.
    pub async fn unsubscribe(&self, channel: &str) -> Result<bool> {
        if self.inner.registry.lock().remove(channel).is_none() {
            return Ok(false);
        }
        if let Some(link) = self.inner.current_link()
            && let Err(err) = link.unsubscribe(channel).await
        {
            tracing::debug!(channel, error = %err, "broker unsubscribe failed");
        }
        Ok(true)
    }

    /// Close the connection and release every registration. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = inner.dispatch.lock().take() {
            handle.abort();
        }
        inner.registry.lock().clear();
        let link = inner.link.lock().take();
        inner.set_state(ConnectionState::Disconnected);
        if let Some(link) = link {
            link.close().await;
            tracing::info!(client_id = ?self.client_id(), "session disconnected");
        }
    }
}

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "session state");
        }
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link.lock().clone()
    }

    async fn resubscribe(&self, link: &dyn Link) -> std::result::Result<(), LinkError> {
        let channels: Vec<String> = self.registry.lock().keys().cloned().collect();
        for channel in channels {
            link.subscribe(&channel, self.config.subscribe_quality)
                .await?;
        }
        Ok(())
    }

    // Caller holds the lifecycle lock.
    fn install(self: &Arc<Self>, connection: Connection, epoch: u64) {
        let Connection { link, events } = connection;
        *self.link.lock() = Some(link);
        let handle = tokio::spawn(run_dispatch(Arc::downgrade(self), events, epoch));
        *self.dispatch.lock() = Some(handle);
        self.set_state(ConnectionState::Connected);
    }

    fn dispatch(&self, delivery: Delivery) {
        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .iter()
            .filter(|(filter, _)| topic::matches(filter, &delivery.channel))
            .map(|(_, handler)| handler.clone())
            .collect();
        if handlers.is_empty() {
            tracing::debug!(channel = %delivery.channel, "no handler for delivery");
            return;
        }
        metrics::counter!("courier_session_deliveries_total").increment(1);
        for handler in handlers {
            let message = delivery.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                tracing::warn!(channel = %delivery.channel, "subscription handler panicked");
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.get_mut().take() {
            handle.abort();
        }
        if let Some(link) = self.link.get_mut().take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { link.close().await });
        }
    }
}

// Drains link events for one connection chain. The task only holds a weak
// reference so dropping every `Session` handle tears it down.
async fn run_dispatch(
    session: Weak<SessionInner>,
    mut events: mpsc::Receiver<LinkEvent>,
    epoch: u64,
) {
    loop {
        let reason = loop {
            match events.recv().await {
                Some(LinkEvent::Message(delivery)) => {
                    let Some(inner) = session.upgrade() else {
                        return;
                    };
                    inner.dispatch(delivery);
                }
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };
        match reconnect(&session, epoch, reason).await {
            Some(next) => events = next,
            None => return,
        }
    }
}

async fn reconnect(
    session: &Weak<SessionInner>,
    epoch: u64,
    reason: Option<String>,
) -> Option<mpsc::Receiver<LinkEvent>> {
    let (policy, connect_timeout, connector) = {
        let inner = session.upgrade()?;
        let _guard = inner.lifecycle.lock().await;
        if !inner.is_current(epoch) {
            return None;
        }
        inner.link.lock().take();
        inner.set_state(ConnectionState::Reconnecting);
        metrics::counter!("courier_session_connection_drops_total").increment(1);
        tracing::warn!(reason = reason.as_deref().unwrap_or("unknown"), "connection lost");
        (
            inner.config.reconnect.clone(),
            inner.config.connect_timeout,
            inner.connector.clone(),
        )
    };

    for (attempt, delay) in policy.delays().enumerate() {
        tokio::time::sleep(delay).await;
        let inner = session.upgrade()?;
        let _guard = inner.lifecycle.lock().await;
        if !inner.is_current(epoch) {
            return None;
        }
        let options = inner.options.lock().clone()?;
        let attempt = attempt + 1;
        let connection =
            match tokio::time::timeout(connect_timeout, connector.connect(&options)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    tracing::warn!(attempt, error = %err, "reconnect attempt failed");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(attempt, timeout = ?connect_timeout, "reconnect attempt timed out");
                    continue;
                }
            };
        if let Err(err) = inner.resubscribe(connection.link.as_ref()).await {
            tracing::warn!(attempt, error = %err, "resubscribe after reconnect failed");
            connection.link.close().await;
            continue;
        }
        let Connection { link, events } = connection;
        *inner.link.lock() = Some(link);
        inner.set_state(ConnectionState::Connected);
        metrics::counter!("courier_session_reconnects_total").increment(1);
        tracing::info!(
            attempt,
            channels = inner.registry.lock().len(),
            "session reconnected"
        );
        return Some(events);
    }

    let inner = session.upgrade()?;
    let _guard = inner.lifecycle.lock().await;
    if inner.is_current(epoch) {
        // Registrations survive so an explicit connect can restore them.
        inner.set_state(ConnectionState::Disconnected);
        tracing::warn!("reconnect attempts exhausted; session disconnected");
    }
    None
}

fn publish_error(err: LinkError) -> Error {
    match err {
        LinkError::Closed | LinkError::Io(_) => Error::NotConnected,
        LinkError::Refused(reason) | LinkError::Rejected(reason) => Error::PublishRejected(reason),
    }
}
