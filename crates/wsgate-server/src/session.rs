//! Handler-facing view of one established connection.
//!
//! Handlers register message and disconnect callbacks and send text through
//! the session. Callbacks run on the connection's reader task, one at a
//! time, in registration order. A failing or panicking callback is logged
//! and the next one still runs.
//!
//! Text waiting for the writer is counted against a per-connection byte
//! limit. A send that would exceed it fails with
//! [`SessionError::Backlogged`] and the connection is closed with 1008.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use wsgate_settings::DEFAULT_MAX_OUTBOUND_BYTES;

use crate::errors::SessionError;
use crate::frame::{Frame, close_code};
use crate::tokens::UserId;
use crate::uri::QueryParams;

/// Callback invoked for each message or on disconnect.
pub type SessionCallback = Arc<dyn Fn(&ConnectionSession) -> anyhow::Result<()> + Send + Sync>;

/// Item on a connection's outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Application text message.
    Text(String),
    /// Control frame (pong or close).
    Control(Frame),
}

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
/// Receiving half, drained by the connection's writer task.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Identity of a connection, fixed at handshake time.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Tenant segment of the connection path.
    pub tenant: String,
    /// Handler segment of the connection path.
    pub handler_name: String,
    /// Authenticated user.
    pub user: UserId,
    /// Query parameters of the upgrade request.
    pub parameters: QueryParams,
}

/// One established WebSocket connection.
pub struct ConnectionSession {
    id: Uuid,
    info: SessionInfo,
    connected_at: Instant,
    outbound: OutboundSender,
    message_callbacks: Mutex<Vec<SessionCallback>>,
    disconnect_callbacks: Mutex<Vec<SessionCallback>>,
    current_message: Mutex<Option<String>>,
    connected: AtomicBool,
    pending_bytes: AtomicUsize,
    outbound_limit: usize,
    overflow: CancellationToken,
}

impl ConnectionSession {
    /// Create a session whose outbound messages go to `outbound`.
    ///
    /// At most `outbound_limit` bytes of text may wait for the writer.
    pub fn new(info: SessionInfo, outbound: OutboundSender, outbound_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::now_v7(),
            info,
            connected_at: Instant::now(),
            outbound,
            message_callbacks: Mutex::new(Vec::new()),
            disconnect_callbacks: Mutex::new(Vec::new()),
            current_message: Mutex::new(None),
            connected: AtomicBool::new(true),
            pending_bytes: AtomicUsize::new(0),
            outbound_limit,
            overflow: CancellationToken::new(),
        })
    }

    /// Create a session with a fresh outbound queue, returning both ends.
    pub fn channel(info: SessionInfo) -> (Arc<Self>, OutboundReceiver) {
        Self::channel_with_limit(info, DEFAULT_MAX_OUTBOUND_BYTES)
    }

    /// [`channel`](Self::channel) with an explicit outbound byte limit.
    pub fn channel_with_limit(
        info: SessionInfo,
        outbound_limit: usize,
    ) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(info, tx, outbound_limit), rx)
    }

    /// Unique connection id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Tenant the connection is bound to.
    pub fn tenant(&self) -> &str {
        &self.info.tenant
    }

    /// Handler name from the connection path.
    pub fn handler_name(&self) -> &str {
        &self.info.handler_name
    }

    /// Authenticated user.
    pub fn user(&self) -> &UserId {
        &self.info.user
    }

    /// Query parameters of the upgrade request.
    pub fn parameters(&self) -> &QueryParams {
        &self.info.parameters
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a text message for the client.
    ///
    /// Safe from any thread. Messages from one session are written in the
    /// order they were sent. Fails with [`SessionError::Backlogged`] once
    /// the client has fallen behind by more than the outbound limit; the
    /// connection is then closed and every later send fails too.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        let limit = self.outbound_limit;
        if self.overflow.is_cancelled() {
            return Err(SessionError::Backlogged { limit });
        }
        let text = text.into();
        let len = text.len();
        let pending = self.pending_bytes.fetch_add(len, Ordering::AcqRel).saturating_add(len);
        if pending > limit {
            let _ = self.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            if !self.overflow.is_cancelled() {
                warn!(
                    connection = %self.id,
                    pending_bytes = pending - len,
                    limit,
                    "outbound queue limit exceeded, closing connection"
                );
                self.overflow.cancel();
            }
            return Err(SessionError::Backlogged { limit });
        }
        if self.outbound.send(Outbound::Text(text)).is_err() {
            let _ = self.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Text bytes queued but not yet taken by the writer.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Release `bytes` of queued text once the writer has taken it.
    pub(crate) fn dequeued(&self, bytes: usize) {
        let _ = self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Cancelled when a send exceeds the outbound limit.
    pub(crate) fn overflow(&self) -> CancellationToken {
        self.overflow.clone()
    }

    /// Push onto the outbound queue regardless of state; used by the driver
    /// for control frames.
    pub(crate) fn queue(&self, item: Outbound) {
        let _ = self.outbound.send(item);
    }

    /// Ask the server to close the connection with status 1000.
    pub fn close(&self) {
        let _ = self
            .outbound
            .send(Outbound::Control(Frame::close(close_code::NORMAL, "")));
    }

    /// Register a callback for each incoming message.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&ConnectionSession) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.message_callbacks.lock().push(Arc::new(callback));
    }

    /// Register a callback for when the connection terminates.
    ///
    /// Ignored when the session has already disconnected.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&ConnectionSession) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut callbacks = self.disconnect_callbacks.lock();
        if !self.is_connected() {
            debug!(connection = %self.id, "disconnect callback registered after close, ignoring");
            return;
        }
        callbacks.push(Arc::new(callback));
    }

    /// Message being delivered, only while a message callback is running.
    pub fn recv(&self) -> Option<String> {
        self.current_message.lock().clone()
    }

    /// Run every message callback for `text`, in order.
    pub fn deliver(&self, text: String) {
        let callbacks = self.message_callbacks.lock().clone();
        *self.current_message.lock() = Some(text);
        for callback in &callbacks {
            self.report("message", run_guarded(|| callback(self)));
        }
        *self.current_message.lock() = None;
    }

    /// Mark the session closed and run every disconnect callback once.
    ///
    /// Later calls do nothing. Callback lists are released afterwards.
    pub fn disconnect(&self) {
        let callbacks = {
            let mut guard = self.disconnect_callbacks.lock();
            if !self.connected.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        debug!(connection = %self.id, callbacks = callbacks.len(), "delivering disconnect");
        for callback in &callbacks {
            self.report("disconnect", run_guarded(|| callback(self)));
        }
        self.message_callbacks.lock().clear();
    }

    fn report(&self, kind: &'static str, outcome: Result<(), CallbackFailure>) {
        match outcome {
            Ok(()) => {}
            Err(CallbackFailure::Error(error)) => warn!(
                tenant = %self.info.tenant,
                handler = %self.info.handler_name,
                connection = %self.id,
                error = ?error,
                "{kind} callback failed"
            ),
            Err(CallbackFailure::Panic(message)) => warn!(
                tenant = %self.info.tenant,
                handler = %self.info.handler_name,
                connection = %self.id,
                panic = %message,
                "{kind} callback panicked"
            ),
        }
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("tenant", &self.info.tenant)
            .field("handler_name", &self.info.handler_name)
            .field("user", &self.info.user)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Why a handler callback did not complete.
#[derive(Debug)]
pub enum CallbackFailure {
    /// The callback returned an error.
    Error(anyhow::Error),
    /// The callback panicked; the payload rendered as text.
    Panic(String),
}

/// Run handler code, converting errors and panics into [`CallbackFailure`].
pub fn run_guarded<F>(f: F) -> Result<(), CallbackFailure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(CallbackFailure::Error(error)),
        Err(payload) => Err(CallbackFailure::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
