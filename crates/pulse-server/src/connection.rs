use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use pulse_core::{ConnectionId, WriteError};
use tokio::sync::{mpsc, Mutex};

/// Lifecycle state of a subscriber connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Write half of a subscriber's output stream.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write(&self, frame: Bytes) -> Result<(), WriteError>;
}

/// Frame sink backed by a bounded queue that the response body drains.
///
/// A write waits at most `write_timeout` for queue space. A subscriber that
/// stays that far behind is treated as failed.
pub struct QueueSink {
    tx: mpsc::Sender<Bytes>,
    write_timeout: Duration,
}

impl QueueSink {
    pub fn new(tx: mpsc::Sender<Bytes>, write_timeout: Duration) -> Self {
        Self { tx, write_timeout }
    }
}

#[async_trait]
impl FrameSink for QueueSink {
    async fn write(&self, frame: Bytes) -> Result<(), WriteError> {
        match self.tx.send_timeout(frame, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(WriteError::Timeout(self.write_timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(WriteError::Closed),
        }
    }
}

/// One subscriber's open output channel.
pub struct ClientConnection {
    id: ConnectionId,
    // One in-flight write per connection.
    writer: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    connected_at: Instant,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, writer: impl FrameSink + 'static) -> Self {
        Self {
            id,
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Move to `Closed`. Returns `true` only for the call that made the
    /// transition.
    pub fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Append a frame to the subscriber's stream.
    pub async fn write(&self, frame: Bytes) -> Result<(), WriteError> {
        let writer = self.writer.lock().await;
        if !self.is_active() {
            return Err(WriteError::Closed);
        }
        writer.write(frame).await
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Sink that records frames, or rejects every write when `failing`.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub frames: Arc<parking_lot::Mutex<Vec<Bytes>>>,
        pub failing: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            let sink = Self::default();
            sink.failing.store(true, Ordering::SeqCst);
            sink
        }

        pub fn received(&self) -> Vec<Bytes> {
            self.frames.lock().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write(&self, frame: Bytes) -> Result<(), WriteError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(WriteError::Closed);
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }
}
