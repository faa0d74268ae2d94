//! DeviceSession: one live connection to a device plus its request queue.
//!
//! A session owns a bounded FIFO queue and a single worker task that drains
//! it.  The worker is the only code that ever touches the socket, so at most
//! one request per device is on the wire at any moment and requests are
//! answered in the order they were accepted.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! register ──► worker spawned ──► (request ─► reply)* ──► I/O error / peer close / disconnect
//!                                                               │
//!                                               session removed from registry,
//!                                               queued callers see ConnectionClosed
//! ```
//!
//! Sessions for different devices share nothing, so a slow device never
//! delays another device's traffic.

mod dispatch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use mbgw_core::{RegisterRequest, TransactionCounter};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::device_registry::DeviceRegistry;
use crate::{DeviceId, GatewayError};

/// Smallest accepted per-device queue capacity.
pub const MIN_QUEUE_CAPACITY: usize = 100;

/// Largest accepted per-device queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 1000;

// ── Configuration ─────────────────────────────────────────────────────────────

/// What the worker does when a reply carries a different transaction id
/// than the request it just sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionIdPolicy {
    /// Deliver the reply without comment.
    Ignore,
    /// Deliver the reply and log a warning.
    #[default]
    Warn,
    /// Fail the request with [`GatewayError::TransactionMismatch`].  The
    /// session stays up.
    Reject,
}

/// Per-session settings handed to [`DeviceRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Requested queue capacity; clamped into
    /// [`MIN_QUEUE_CAPACITY`]..=[`MAX_QUEUE_CAPACITY`].
    pub queue_capacity: usize,
    pub transaction_id_policy: TransactionIdPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: MIN_QUEUE_CAPACITY,
            transaction_id_policy: TransactionIdPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .clamp(MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY)
    }
}

// ── Queue entries ─────────────────────────────────────────────────────────────

/// Where a finished request's outcome is delivered.
pub(crate) type ReplySender = oneshot::Sender<Result<Vec<u8>, GatewayError>>;

/// A request waiting in a device queue together with its reply channel.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub request: RegisterRequest,
    pub reply: ReplySender,
}

impl PendingRequest {
    /// Hands the outcome back to the caller.  A caller that already gave up
    /// (timed out) has dropped its receiver; the result is discarded.
    pub(crate) fn deliver(self, device_id: DeviceId, result: Result<Vec<u8>, GatewayError>) {
        if self.reply.send(result).is_err() {
            debug!(device_id, "caller gone; reply discarded");
        }
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Counters updated by the worker, read by [`DeviceSession::stats`].
#[derive(Debug)]
pub(crate) struct SessionStats {
    requests: AtomicU64,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    connected_at_ms: u64,
    last_seen_ms: AtomicU64,
}

impl SessionStats {
    fn new() -> Self {
        let now = unix_millis();
        Self {
            requests: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            connected_at_ms: now,
            last_seen_ms: AtomicU64::new(now),
        }
    }

    /// Counts a request frame once it has been written to the socket.
    pub(crate) fn record_tx(&self, bytes: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_seen_ms.store(unix_millis(), Ordering::Relaxed);
    }
}

/// Point-in-time view of one session, served by `GET /stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub device_id: DeviceId,
    pub session_id: Uuid,
    pub peer: String,
    /// Unix epoch milliseconds.
    pub connected_at_ms: u64,
    /// Unix epoch milliseconds of the last byte received (or of connect).
    pub last_seen_ms: u64,
    pub requests: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    /// Requests accepted but not yet picked up by the worker.
    pub queue_depth: usize,
    /// Most recent transaction id sent; 0 before the first request.
    pub last_transaction_id: u16,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── DeviceSession ─────────────────────────────────────────────────────────────

/// Handle to a running session.  Held by the registry; cloned (as `Arc`) by
/// callers that enqueue requests.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: DeviceId,
    session_id: Uuid,
    peer: String,
    queue: mpsc::Sender<PendingRequest>,
    stats: Arc<SessionStats>,
    transactions: Arc<TransactionCounter>,
    worker: AbortHandle,
}

impl DeviceSession {
    /// Starts the worker task for `stream` and returns the session handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<S>(
        device_id: DeviceId,
        peer: String,
        stream: S,
        config: &SessionConfig,
        registry: Weak<DeviceRegistry>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let (queue, rx) = mpsc::channel(config.effective_queue_capacity());
        let stats = Arc::new(SessionStats::new());
        let transactions = Arc::new(TransactionCounter::new());

        let dispatcher = dispatch::Dispatcher {
            device_id,
            session_id,
            stream: BufReader::new(stream),
            rx,
            stats: Arc::clone(&stats),
            transactions: Arc::clone(&transactions),
            policy: config.transaction_id_policy,
            registry,
        };
        let worker = tokio::spawn(dispatcher.run()).abort_handle();

        info!(device_id, %session_id, %peer, "device session started");

        Arc::new(Self {
            device_id,
            session_id,
            peer,
            queue,
            stats,
            transactions,
            worker,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Appends a request to the queue without waiting.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::QueueFull`] when the queue is at capacity.
    /// - [`GatewayError::DeviceNotConnected`] when the worker has already
    ///   shut the queue down.
    pub(crate) fn try_enqueue(&self, pending: PendingRequest) -> Result<(), GatewayError> {
        use mpsc::error::TrySendError;

        self.queue.try_send(pending).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::QueueFull(self.device_id),
            TrySendError::Closed(_) => GatewayError::DeviceNotConnected(self.device_id),
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            device_id: self.device_id,
            session_id: self.session_id,
            peer: self.peer.clone(),
            connected_at_ms: self.stats.connected_at_ms,
            last_seen_ms: self.stats.last_seen_ms.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
            bytes_tx: self.stats.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.stats.bytes_rx.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            last_transaction_id: self.transactions.current(),
        }
    }

    /// Aborts the worker.  The socket closes and every queued request
    /// resolves with [`GatewayError::ConnectionClosed`].
    pub(crate) fn stop(&self) {
        self.worker.abort();
    }

    /// Whether the worker has exited (I/O failure or [`Self::stop`]).
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}
