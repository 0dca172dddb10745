//! Channels and the store that addresses them.
//!
//! A [`Channel`] owns one registry and its dispatcher; all subscribers of one
//! routing key live in the same channel. The [`ChannelStore`] creates a
//! channel on first subscribe, evicts channels that stay empty, and tears
//! everything down on shutdown.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use pin_project_lite::pin_project;
use pulse_core::{ChannelKey, ConnectionId, HubError};
use pulse_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ChannelSettings;
use crate::connection::QueueSink;
use crate::dispatcher::{validate_message, BroadcastDispatcher};
use crate::registry::ConnectionRegistry;

/// One registry plus its dispatcher, addressed by a channel key.
pub struct Channel {
    key: ChannelKey,
    registry: Arc<ConnectionRegistry>,
    dispatcher: BroadcastDispatcher,
    settings: ChannelSettings,
    metrics: Arc<MetricsRecorder>,
    created_at: Instant,
    last_active_ms: AtomicU64,
}

/// A freshly registered subscriber: its ID and the read half of its stream.
pub struct Subscription {
    pub id: ConnectionId,
    pub stream: SubscriberStream,
}

impl Channel {
    pub fn new(key: ChannelKey, settings: ChannelSettings, metrics: Arc<MetricsRecorder>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(settings.max_connections));
        let dispatcher = BroadcastDispatcher::new(
            key.clone(),
            Arc::clone(&registry),
            settings.fan_out,
            Arc::clone(&metrics),
        );
        Self {
            key,
            registry,
            dispatcher,
            settings,
            metrics,
            created_at: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Register a new subscriber and hand back the read half of its stream.
    /// Dropping the stream disconnects the subscriber.
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription, HubError> {
        let (tx, rx) = mpsc::channel(self.settings.send_queue_capacity);
        let id = self
            .registry
            .register(QueueSink::new(tx, self.settings.write_timeout))?;
        self.touch();
        self.record_connections();

        tracing::info!(
            channel = %self.key,
            connection_id = %id,
            connections = self.registry.len(),
            "Client connected"
        );

        Ok(Subscription {
            id: id.clone(),
            stream: SubscriberStream {
                frames: ReceiverStream::new(rx),
                guard: DisconnectGuard {
                    id,
                    channel: Arc::clone(self),
                },
            },
        })
    }

    /// Transport-side abort. Safe to call after the connection was already
    /// removed by a failed write.
    pub fn on_disconnect(&self, id: &ConnectionId) {
        if self.registry.unregister(id) {
            self.touch();
            self.record_connections();
            tracing::info!(
                channel = %self.key,
                connection_id = %id,
                connections = self.registry.len(),
                "Client disconnected"
            );
        } else {
            tracing::debug!(
                channel = %self.key,
                connection_id = %id,
                "Disconnect for already-removed client"
            );
        }
    }

    pub async fn broadcast(&self, message: &str) -> Result<usize, HubError> {
        self.touch();
        let result = self.dispatcher.broadcast(message).await;
        self.record_connections();
        result
    }

    pub async fn send_to(&self, id: &ConnectionId, message: &str) -> Result<bool, HubError> {
        self.touch();
        let result = self.dispatcher.send_to(id, message).await;
        self.record_connections();
        result
    }

    /// Empty, and untouched for at least `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.registry.is_empty() && self.idle_for() >= idle_timeout
    }

    /// Disconnect every subscriber. Their streams end once the last pending
    /// frame is read.
    pub fn close(&self) -> usize {
        let closed = self.registry.drain();
        self.record_connections();
        if closed > 0 {
            tracing::info!(channel = %self.key, closed = closed, "Channel closed");
        }
        closed
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn record_connections(&self) {
        self.metrics.gauge_set(
            "connections.active",
            &[("channel", self.key.as_str())],
            self.registry.len() as f64,
        );
    }
}

/// Fires `on_disconnect` when the transport drops the stream.
struct DisconnectGuard {
    id: ConnectionId,
    channel: Arc<Channel>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.channel.on_disconnect(&self.id);
    }
}

pin_project! {
    /// Read half of a subscriber's output stream, yielding framed bytes.
    pub struct SubscriberStream {
        #[pin]
        frames: ReceiverStream<Bytes>,
        guard: DisconnectGuard,
    }
}

impl SubscriberStream {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.guard.id
    }
}

impl Stream for SubscriberStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().frames.poll_next(cx).map(|frame| frame.map(Ok))
    }
}

/// All channels of the process, keyed by routing key.
pub struct ChannelStore {
    channels: DashMap<ChannelKey, Arc<Channel>>,
    settings: ChannelSettings,
    metrics: Arc<MetricsRecorder>,
    // Set once by `close_all`; refuses new subscribers from then on.
    closing: AtomicBool,
}

impl ChannelStore {
    pub fn new(settings: ChannelSettings, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            channels: DashMap::new(),
            settings,
            metrics,
            closing: AtomicBool::new(false),
        }
    }

    /// Subscribe to `key`, creating the channel on first use.
    pub fn subscribe(&self, key: &ChannelKey) -> Result<Subscription, HubError> {
        // Registration happens under the entry lock so neither eviction nor
        // `close_all` can pass this shard between the check and register.
        let entry = self.channels.entry(key.clone());
        if self.is_closing() {
            tracing::debug!(channel = %key, "Subscribe refused, store closing");
            return Err(HubError::ShuttingDown);
        }
        let entry = entry.or_insert_with(|| {
            tracing::info!(channel = %key, "Channel created");
            Arc::new(Channel::new(
                key.clone(),
                self.settings.clone(),
                Arc::clone(&self.metrics),
            ))
        });
        entry.value().subscribe()
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Broadcast on `key`. A channel nobody ever subscribed to delivers to
    /// zero clients and is not created.
    pub async fn broadcast(&self, key: &ChannelKey, message: Option<&str>) -> Result<usize, HubError> {
        let message = validate_message(message)?;
        match self.get(key) {
            Some(channel) => channel.broadcast(message).await,
            None => {
                tracing::debug!(channel = %key, "Broadcast to channel without subscribers");
                Ok(0)
            }
        }
    }

    pub async fn send_to(
        &self,
        key: &ChannelKey,
        id: &ConnectionId,
        message: Option<&str>,
    ) -> Result<bool, HubError> {
        let message = validate_message(message)?;
        let channel = self
            .get(key)
            .ok_or_else(|| HubError::UnknownConnection(id.clone()))?;
        channel.send_to(id, message).await
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Connected clients across every channel.
    pub fn connection_count(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().connection_count())
            .sum()
    }

    /// Drop channels that have been empty for `idle_timeout`.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let candidates: Vec<ChannelKey> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_idle(idle_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if self
                .channels
                .remove_if(&key, |_, channel| channel.is_idle(idle_timeout))
                .is_some()
            {
                evicted += 1;
                tracing::info!(channel = %key, "Idle channel evicted");
            }
        }
        evicted
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Close every channel and refuse new subscribers. Returns the number of
    /// subscribers disconnected.
    pub fn close_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let mut closed = 0;
        self.channels.retain(|_, channel| {
            closed += channel.close();
            false
        });
        closed
    }
}

/// Start a background task that periodically evicts idle channels.
pub fn start_cleanup_task(
    store: Arc<ChannelStore>,
    interval: Duration,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = store.evict_idle(idle_timeout);
            if evicted > 0 {
                tracing::info!(evicted = evicted, "Idle channel cleanup");
            }
        }
    })
}
