//! Broadcast fan-out.
//!
//! A broadcast formats its message once, snapshots the registry and writes
//! the shared frame to every connection in the snapshot. A failed write
//! unregisters that connection and the fan-out carries on; the caller only
//! sees the number of successful deliveries.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use pulse_core::{ChannelKey, ConnectionId, HubError, StreamFormatter};
use pulse_telemetry::MetricsRecorder;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::connection::ClientConnection;
use crate::registry::ConnectionRegistry;

/// How the writes of a single broadcast are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// One connection after another.
    #[default]
    Sequential,
    /// All writes of a broadcast polled together.
    Concurrent,
}

impl FromStr for FanOut {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(format!("unknown fan-out mode: {other}")),
        }
    }
}

/// Reject absent or empty messages before any dispatch happens.
pub fn validate_message(message: Option<&str>) -> Result<&str, HubError> {
    match message {
        Some(m) if !m.is_empty() => Ok(m),
        _ => Err(HubError::InvalidMessage),
    }
}

/// Writes messages to every connection of one registry.
pub struct BroadcastDispatcher {
    channel: ChannelKey,
    registry: Arc<ConnectionRegistry>,
    fan_out: FanOut,
    // Held for a whole fan-out so broadcasts on one channel never interleave.
    serial: Mutex<()>,
    metrics: Arc<MetricsRecorder>,
}

impl BroadcastDispatcher {
    pub fn new(
        channel: ChannelKey,
        registry: Arc<ConnectionRegistry>,
        fan_out: FanOut,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            channel,
            registry,
            fan_out,
            serial: Mutex::new(()),
            metrics,
        }
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    /// Deliver `message` to every connected client.
    ///
    /// Returns the number of successful deliveries. Zero covers both "no
    /// subscribers" and "every write failed".
    pub async fn broadcast(&self, message: &str) -> Result<usize, HubError> {
        let message = validate_message(Some(message))?;
        let frame = StreamFormatter::format(message);

        let _serial = self.serial.lock().await;
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let attempted = snapshot.len();

        let delivered = match self.fan_out {
            FanOut::Sequential => {
                let mut delivered = 0;
                for connection in &snapshot {
                    if self.deliver(connection, frame.clone()).await {
                        delivered += 1;
                    }
                }
                delivered
            }
            FanOut::Concurrent => join_all(
                snapshot
                    .iter()
                    .map(|connection| self.deliver(connection, frame.clone())),
            )
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count(),
        };

        let labels = [("channel", self.channel.as_str())];
        self.metrics.counter_inc("broadcast.total", &labels, 1);
        self.metrics
            .counter_inc("broadcast.delivered", &labels, delivered as u64);
        self.metrics.histogram_observe(
            "broadcast.duration_ms",
            &labels,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        tracing::info!(
            channel = %self.channel,
            attempted = attempted,
            delivered = delivered,
            "Message broadcast"
        );
        Ok(delivered)
    }

    /// Deliver `message` to a single connection.
    ///
    /// Returns whether the write succeeded; a failed write removes the
    /// connection exactly as a broadcast would.
    pub async fn send_to(&self, id: &ConnectionId, message: &str) -> Result<bool, HubError> {
        let message = validate_message(Some(message))?;
        let connection = self
            .registry
            .get(id)
            .ok_or_else(|| HubError::UnknownConnection(id.clone()))?;
        let frame = StreamFormatter::format(message);

        let _serial = self.serial.lock().await;
        let delivered = self.deliver(&connection, frame).await;
        tracing::debug!(
            channel = %self.channel,
            connection_id = %id,
            delivered = delivered,
            "Message sent to client"
        );
        Ok(delivered)
    }

    /// Write one frame, reaping the connection on failure.
    async fn deliver(&self, connection: &ClientConnection, frame: Bytes) -> bool {
        match connection.write(frame).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.counter_inc(
                    "broadcast.write_failures",
                    &[("channel", self.channel.as_str()), ("kind", e.error_kind())],
                    1,
                );
                if self.registry.unregister(connection.id()) {
                    tracing::warn!(
                        channel = %self.channel,
                        connection_id = %connection.id(),
                        error = %e,
                        "Write failed, client removed"
                    );
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::test_support::RecordingSink;
    use crate::connection::FrameSink;
    use async_trait::async_trait;
    use pulse_core::WriteError;

    fn dispatcher(fan_out: FanOut) -> (BroadcastDispatcher, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::unbounded());
        let dispatcher = BroadcastDispatcher::new(
            ChannelKey::default(),
            Arc::clone(&registry),
            fan_out,
            Arc::new(MetricsRecorder::new()),
        );
        (dispatcher, registry)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let a = RecordingSink::default();
        let b = RecordingSink::default();
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        let delivered = dispatcher.broadcast("x").await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.received(), vec![Bytes::from_static(b"data: x\n\n")]);
        assert_eq!(b.received(), vec![Bytes::from_static(b"data: x\n\n")]);
    }

    #[tokio::test]
    async fn broadcast_without_clients_reports_zero() {
        let (dispatcher, _registry) = dispatcher(FanOut::Sequential);
        assert_eq!(dispatcher.broadcast("x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_dispatch() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let sink = RecordingSink::default();
        registry.register(sink.clone()).unwrap();

        let err = dispatcher.broadcast("").await.unwrap_err();
        assert_eq!(err, HubError::InvalidMessage);
        assert_eq!(registry.len(), 1);
        assert!(sink.received().is_empty());
    }

    #[test]
    fn validate_message_cases() {
        assert_eq!(validate_message(Some("hi")), Ok("hi"));
        assert_eq!(validate_message(Some("")), Err(HubError::InvalidMessage));
        assert_eq!(validate_message(None), Err(HubError::InvalidMessage));
    }

    #[tokio::test]
    async fn failed_client_is_removed_and_others_still_served() {
        for fan_out in [FanOut::Sequential, FanOut::Concurrent] {
            let (dispatcher, registry) = dispatcher(fan_out);
            let a = RecordingSink::failing();
            let b = RecordingSink::default();
            let a_id = registry.register(a).unwrap();
            let b_id = registry.register(b.clone()).unwrap();

            let before = registry.len();
            let delivered = dispatcher.broadcast("x").await.unwrap();
            assert_eq!(delivered, 1, "{fan_out:?}");
            assert!(delivered <= before);

            let remaining: Vec<ConnectionId> =
                registry.snapshot().iter().map(|c| c.id().clone()).collect();
            assert_eq!(remaining, vec![b_id.clone()]);
            assert!(!registry.contains(&a_id));
            assert_eq!(b.received().len(), 1);
        }
    }

    #[tokio::test]
    async fn failed_client_is_not_retried() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        struct CountingFailure(Arc<std::sync::atomic::AtomicUsize>);

        #[async_trait]
        impl FrameSink for CountingFailure {
            async fn write(&self, _frame: Bytes) -> Result<(), WriteError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(WriteError::Closed)
            }
        }

        registry
            .register(CountingFailure(Arc::clone(&attempts)))
            .unwrap();
        registry.register(RecordingSink::default()).unwrap();

        assert_eq!(dispatcher.broadcast("first").await.unwrap(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(dispatcher.broadcast("second").await.unwrap(), 1);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_failing_reports_zero_and_empties_registry() {
        let (dispatcher, registry) = dispatcher(FanOut::Concurrent);
        for _ in 0..3 {
            registry.register(RecordingSink::failing()).unwrap();
        }

        assert_eq!(dispatcher.broadcast("x").await.unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sequential_broadcasts_arrive_in_order() {
        let (dispatcher, registry) = dispatcher(FanOut::Concurrent);
        let sink = RecordingSink::default();
        registry.register(sink.clone()).unwrap();

        for msg in ["1", "2", "3"] {
            dispatcher.broadcast(msg).await.unwrap();
        }

        let frames: Vec<Bytes> = sink.received();
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"data: 1\n\n"),
                Bytes::from_static(b"data: 2\n\n"),
                Bytes::from_static(b"data: 3\n\n"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_client_does_not_block_others_forever() {
        use crate::connection::QueueSink;
        use tokio::sync::mpsc;

        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow_id = registry
            .register(QueueSink::new(slow_tx, Duration::from_millis(100)))
            .unwrap();
        registry
            .register(QueueSink::new(fast_tx, Duration::from_millis(100)))
            .unwrap();

        assert_eq!(dispatcher.broadcast("a").await.unwrap(), 2);
        // slow client's queue is now full and never drained
        assert_eq!(dispatcher.broadcast("b").await.unwrap(), 1);
        assert!(!registry.contains(&slow_id));

        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"data: a\n\n"));
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"data: b\n\n"));
    }

    #[tokio::test]
    async fn send_to_targets_one_client() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let a = RecordingSink::default();
        let b = RecordingSink::default();
        let a_id = registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert!(dispatcher.send_to(&a_id, "only a").await.unwrap());
        assert_eq!(a.received().len(), 1);
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_client_fails() {
        let (dispatcher, _registry) = dispatcher(FanOut::Sequential);
        let id = ConnectionId::new();
        let err = dispatcher.send_to(&id, "hi").await.unwrap_err();
        assert_eq!(err, HubError::UnknownConnection(id));
    }

    #[tokio::test]
    async fn send_to_failing_client_removes_it() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        let id = registry.register(RecordingSink::failing()).unwrap();

        assert!(!dispatcher.send_to(&id, "hi").await.unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn metrics_track_deliveries_and_failures() {
        let (dispatcher, registry) = dispatcher(FanOut::Sequential);
        registry.register(RecordingSink::default()).unwrap();
        registry.register(RecordingSink::failing()).unwrap();

        dispatcher.broadcast("x").await.unwrap();

        let metrics = &dispatcher.metrics;
        let labels = [("channel", "default")];
        assert_eq!(metrics.counter_get("broadcast.total", &labels), 1);
        assert_eq!(metrics.counter_get("broadcast.delivered", &labels), 1);
        assert_eq!(
            metrics.counter_get(
                "broadcast.write_failures",
                &[("channel", "default"), ("kind", "closed")]
            ),
            1
        );
        assert_eq!(metrics.histogram_summary("broadcast.duration_ms", &labels).count, 1);
    }

    #[test]
    fn fan_out_parses() {
        assert_eq!("sequential".parse::<FanOut>(), Ok(FanOut::Sequential));
        assert_eq!("Concurrent".parse::<FanOut>(), Ok(FanOut::Concurrent));
        assert!("parallel".parse::<FanOut>().is_err());
    }
}
