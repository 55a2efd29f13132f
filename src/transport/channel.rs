//! Connection handle
//!
//! A [`Channel`] is the registry's view of one live connection: an egress
//! queue of frames, an activity flag, close listeners, and a small table of
//! typed attachments. Writes are non-blocking enqueues onto the connection's
//! egress buffer; the connection's writer task drains the queue in FIFO
//! order and invokes each frame's completion listener after the bytes
//! actually reach the socket.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Completion listener for one queued frame; receives `true` once the bytes
/// were written to the socket, `false` if the write failed or the channel
/// closed first.
pub type WriteListener = Box<dyn FnOnce(bool) + Send + 'static>;

/// Listener fired exactly once when the channel closes
pub type CloseListener = Box<dyn FnOnce(&Arc<Channel>) + Send + 'static>;

/// Item on a channel's egress queue
pub enum Outbound {
    Frame {
        bytes: Bytes,
        listener: Option<WriteListener>,
    },
    /// Writer task shuts the socket down and exits
    Close,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Frame { bytes, listener } => f
                .debug_struct("Frame")
                .field("len", &bytes.len())
                .field("listener", &listener.is_some())
                .finish(),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

/// Handle to one live connection
pub struct Channel {
    id: u64,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Outbound>,
    active: AtomicBool,
    closed: Notify,
    close_listeners: Mutex<Vec<CloseListener>>,
    attributes: Attributes,
}

impl Channel {
    /// Create a channel and hand back the egress receiver for its writer
    /// task (or for a test harness).
    pub fn new(id: u64, peer: Option<SocketAddr>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id,
            peer,
            tx,
            active: AtomicBool::new(true),
            closed: Notify::new(),
            close_listeners: Mutex::new(Vec::new()),
            attributes: Attributes::default(),
        });
        (channel, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Short textual channel id, used in pending-ack keys
    pub fn short_id(&self) -> String {
        format!("{:x}", self.id)
    }

    /// Peer socket address, if the transport provided one
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Typed per-channel attachments
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Enqueue a frame. Returns `false` if the channel is closed.
    pub fn write(&self, bytes: Bytes) -> bool {
        self.write_with_listener(bytes, None)
    }

    /// Enqueue a frame with an optional completion listener.
    ///
    /// The listener fires with `true` after the bytes reach the socket; it
    /// fires with `false` immediately when the channel is already closed.
    pub fn write_with_listener(&self, bytes: Bytes, listener: Option<WriteListener>) -> bool {
        if !self.is_active() {
            if let Some(listener) = listener {
                listener(false);
            }
            return false;
        }

        match self.tx.send(Outbound::Frame { bytes, listener }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(item)) => {
                if let Outbound::Frame {
                    listener: Some(listener),
                    ..
                } = item
                {
                    listener(false);
                }
                false
            }
        }
    }

    /// Close the channel: mark inactive, stop the writer task, wake
    /// [`closed`](Self::closed) waiters and fire close listeners. Idempotent.
    pub fn close(self: &Arc<Self>) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close);
        self.closed.notify_waiters();

        let listeners = std::mem::take(&mut *lock(&self.close_listeners));
        for listener in listeners {
            listener(self);
        }
    }

    /// Register a close listener. Fires immediately if the channel is
    /// already closed.
    pub fn on_close(self: &Arc<Self>, listener: CloseListener) {
        let deferred = {
            let mut listeners = lock(&self.close_listeners);
            if self.is_active() {
                listeners.push(listener);
                None
            } else {
                Some(listener)
            }
        };
        if let Some(listener) = deferred {
            listener(self);
        }
    }

    /// Resolves when the channel closes
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Typed attachment slots keyed by interned names.
///
/// Slots are populated once (get-or-init) and live as long as the channel.
#[derive(Default)]
pub struct Attributes {
    slots: RwLock<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl Attributes {
    /// Look up a slot without creating it
    pub fn get<T: Any + Send + Sync>(&self, key: &'static str) -> Option<Arc<T>> {
        let slots = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Look up a slot, creating it with `init` on first access.
    ///
    /// # Panics
    ///
    /// Panics if the key was previously populated with a different type.
    pub fn get_or_init<T, F>(&self, key: &'static str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = slots
            .entry(key)
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(entry)
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("attribute slot {key:?} holds a different type"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
