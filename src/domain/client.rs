//! Registered stream clients and their send capability.
//!
//! A [`Client`] is the registry's record of one admitted stream. Its
//! [`ClientSink`] is the only way the core writes to the transport: a
//! bounded queue drained by the route layer's stream task. Closing the sink
//! never touches the socket itself, it only stops further writes and lets
//! the stream end once the queue is drained.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{ClientId, Filter, Frame};

/// Reasons a non-blocking delivery attempt can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The per-client outbound queue is full.
    #[error("client outbound buffer is full")]
    Full,
    /// The receiving side is gone or the sink was closed.
    #[error("client connection is closed")]
    Closed,
}

/// Non-blocking, closable write handle for one client stream.
#[derive(Debug)]
pub struct ClientSink {
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    delivered: AtomicU64,
    pending_drops: AtomicU32,
    last_delivery_ms: AtomicI64,
}

impl ClientSink {
    /// Creates a sink with a bounded queue of `capacity` frames, returning
    /// the receiving half for the transport task.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender: Mutex::new(Some(tx)),
            delivered: AtomicU64::new(0),
            pending_drops: AtomicU32::new(0),
            last_delivery_ms: AtomicI64::new(0),
        };
        (sink, rx)
    }

    /// Attempts to enqueue a frame without waiting.
    ///
    /// A successful delivery clears the consecutive-drop counter.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] when the queue has no room and
    /// [`SendError::Closed`] once the sink was closed or the receiver dropped.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), SendError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Closed);
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.pending_drops.store(0, Ordering::Relaxed);
                self.last_delivery_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Records one dropped frame and returns the consecutive drop count.
    pub fn record_drop(&self) -> u32 {
        self.pending_drops
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    /// Stops all further writes. Returns `false` if already closed.
    ///
    /// Frames already queued are still drained by the receiver.
    pub fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Returns `true` once the sink is closed or its receiver dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(mpsc::Sender::is_closed)
    }

    /// Number of frames successfully enqueued.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Consecutive frames dropped since the last successful delivery.
    #[must_use]
    pub fn pending_drops(&self) -> u32 {
        self.pending_drops.load(Ordering::Relaxed)
    }

    /// Time of the last successful delivery, if any.
    #[must_use]
    pub fn last_delivery_at(&self) -> Option<DateTime<Utc>> {
        match self.last_delivery_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// Registry record for one admitted client.
///
/// Cloning is cheap apart from the filter sets; the sink and its counters
/// are shared between clones.
#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    source_ip: IpAddr,
    connected_at: DateTime<Utc>,
    authenticated: bool,
    filter: Filter,
    sink: Arc<ClientSink>,
}

impl Client {
    /// Creates a client record.
    #[must_use]
    pub fn new(
        id: ClientId,
        source_ip: IpAddr,
        authenticated: bool,
        filter: Filter,
        sink: Arc<ClientSink>,
    ) -> Self {
        Self {
            id,
            source_ip,
            connected_at: Utc::now(),
            authenticated,
            filter,
            sink,
        }
    }

    /// Client identifier.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Remote address the stream was opened from.
    #[must_use]
    pub const fn source_ip(&self) -> IpAddr {
        self.source_ip
    }

    /// Admission time.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the client passed the auth gate.
    #[must_use]
    pub const fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Current subscription filter.
    #[must_use]
    pub const fn filter(&self) -> &Filter {
        &self.filter
    }

    pub(crate) fn filter_mut(&mut self) -> &mut Filter {
        &mut self.filter
    }

    /// Shared send capability.
    #[must_use]
    pub fn sink(&self) -> &Arc<ClientSink> {
        &self.sink
    }
}
