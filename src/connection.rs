//! A single live peer link: outbound queue, dispatch table, lifecycle state.
//!
//! [`Connection`] is a cheap-to-clone handle. The endpoint that admitted the
//! connection owns the I/O tasks driving it; the handle only queues outbound
//! messages, edits the dispatch table, and observes or requests lifecycle
//! transitions. State only ever moves forward: `Opening` to `Open` to
//! `Closing` to `Closed`.

use crate::codec::Protocol;
use crate::config::DropPolicy;
use crate::error::{NetError, NetResult};
use crate::Message;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

/// Boxed future returned by message handlers and lifecycle callbacks.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(crate) type MessageHandlerFn<T> = Arc<dyn Fn(Connection<T>, T) -> BoxFuture + Send + Sync>;

/// Lifecycle states of a connection. Ordered: state only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Admitted but not yet serviced by I/O tasks.
    Opening = 0,
    /// Fully serviced; messages flow in both directions.
    Open = 1,
    /// Close requested; I/O tasks are winding down.
    Closing = 2,
    /// I/O tasks finished and the disconnect callback has run.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Counters describing one connection's traffic so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages written to the wire.
    pub messages_sent: u64,
    /// Messages decoded off the wire.
    pub messages_received: u64,
    /// Bytes written to the wire, including stream length prefixes.
    pub bytes_sent: u64,
    /// Bytes read off the wire, including stream length prefixes.
    pub bytes_received: u64,
    /// Received messages dropped because no handler matched their tag.
    pub unhandled_messages: u64,
    /// Outbound messages discarded by the datagram drop policy.
    pub dropped_outbound: u64,
}

#[derive(Default)]
struct StatCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    unhandled_messages: AtomicU64,
    dropped_outbound: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unhandled_messages: self.unhandled_messages.load(Ordering::Relaxed),
            dropped_outbound: self.dropped_outbound.load(Ordering::Relaxed),
        }
    }
}

/// Bounded multi-producer queue with a drop policy, backing datagram sends.
///
/// Senders never block: when the queue is full the policy decides which
/// message to discard. The single consumer is the connection's send task.
pub(crate) struct DatagramQueue<T> {
    messages: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: DropPolicy,
    available: Notify,
}

impl<T: Send> DatagramQueue<T> {
    pub(crate) fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            policy,
            available: Notify::new(),
        }
    }

    /// Enqueue `message`, returning true if the policy discarded a message
    /// (the incoming one under [`DropPolicy::DropNewest`], the oldest queued
    /// one under [`DropPolicy::DropOldest`]).
    pub(crate) fn push(&self, message: T) -> bool {
        let mut queue = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = if queue.len() < self.capacity {
            queue.push_back(message);
            false
        } else {
            match self.policy {
                DropPolicy::DropOldest => {
                    queue.pop_front();
                    queue.push_back(message);
                }
                DropPolicy::DropNewest => drop(message),
            }
            true
        };
        drop(queue);
        self.available.notify_one();
        dropped
    }

    /// Await the next message. Only the send task calls this.
    pub(crate) async fn pop(&self) -> T {
        loop {
            let notified = self.available.notified();
            if let Some(message) = self
                .messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return message;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

enum Outbound<T> {
    Stream(mpsc::Sender<T>),
    Datagram(Arc<DatagramQueue<T>>),
}

struct ConnectionInner<T: Message> {
    id: u64,
    peer: SocketAddr,
    protocol: Protocol,
    state: AtomicU8,
    state_notify: Notify,
    outbound: Outbound<T>,
    handlers: RwLock<HashMap<T::Tag, MessageHandlerFn<T>>>,
    stats: StatCounters,
}

/// Handle to one bidirectional typed message link with a peer.
///
/// Clones share the same underlying connection. Two handles compare equal
/// when they refer to the same connection.
pub struct Connection<T: Message> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T: Message> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Message> PartialEq for Connection<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Message> Eq for Connection<T> {}

impl<T: Message> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("protocol", &self.inner.protocol)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Message> Connection<T> {
    pub(crate) fn new_stream(id: u64, peer: SocketAddr, sender: mpsc::Sender<T>) -> Self {
        Self::new(id, peer, Protocol::Tcp, Outbound::Stream(sender))
    }

    pub(crate) fn new_datagram(id: u64, peer: SocketAddr, queue: Arc<DatagramQueue<T>>) -> Self {
        Self::new(id, peer, Protocol::Udp, Outbound::Datagram(queue))
    }

    fn new(id: u64, peer: SocketAddr, protocol: Protocol, outbound: Outbound<T>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                protocol,
                state: AtomicU8::new(ConnectionState::Opening as u8),
                state_notify: Notify::new(),
                outbound,
                handlers: RwLock::new(HashMap::new()),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Connection number, unique and strictly increasing per endpoint in
    /// admission order. Numbering starts at 1.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Transport protocol this connection runs over.
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True while the connection is open and messages flow.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Snapshot of this connection's traffic counters.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Queue `message` for delivery to the peer and return once queued;
    /// transmission itself is asynchronous.
    ///
    /// On a stream connection a full queue suspends the caller until the
    /// send task drains it, so stream messages are never dropped here. On a
    /// datagram connection a full queue discards a message according to the
    /// configured [`DropPolicy`] instead.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] if the connection is closing or closed. The
    /// message is discarded; nothing reaches the wire.
    pub async fn send(&self, message: T) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::Closed);
        }
        match &self.inner.outbound {
            Outbound::Stream(sender) => {
                if sender.send(message).await.is_err() {
                    return Err(NetError::Closed);
                }
            }
            Outbound::Datagram(queue) => {
                if queue.push(message) {
                    self.inner
                        .stats
                        .dropped_outbound
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        connection = self.inner.id,
                        "outbound datagram queue full, message dropped"
                    );
                }
            }
        }
        Ok(())
    }

    /// Install the handler invoked for inbound messages whose tag equals
    /// `tag`, replacing any previous handler for that tag.
    ///
    /// Handlers run on the connection's receive task, one message at a time
    /// in wire order. A message whose tag has no handler is counted in
    /// [`ConnectionStats::unhandled_messages`] and dropped; the connection
    /// stays open.
    pub fn add_message_handler<F, Fut>(&self, tag: T::Tag, handler: F)
    where
        F: Fn(Connection<T>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandlerFn<T> = Arc::new(move |connection, message| {
            let fut: BoxFuture = Box::pin(handler(connection, message));
            fut
        });
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, handler);
    }

    /// Remove the handler for `tag`, returning true if one was installed.
    pub fn remove_message_handler(&self, tag: &T::Tag) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
            .is_some()
    }

    /// Request an orderly close. Idempotent and non-blocking.
    ///
    /// The I/O tasks stop at their next scheduling point, the connection
    /// leaves its endpoint's list, the disconnect callback fires exactly
    /// once, and the state becomes [`ConnectionState::Closed`]. Await
    /// [`Connection::closed`] to observe that point.
    pub fn close(&self) {
        if self.begin_close() {
            debug!(
                connection = self.inner.id,
                peer = %self.inner.peer,
                "connection close requested"
            );
        }
    }

    /// Wait until the connection is fully closed and its disconnect
    /// callback has finished. Returns immediately if that already happened.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.state_notify.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Move `Opening` to `Open`. Called once by the endpoint before the
    /// connect callback fires.
    pub(crate) fn set_open(&self) {
        let _ = self.inner.state.compare_exchange(
            ConnectionState::Opening as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Move into `Closing` unless already closing or closed. Returns true
    /// for the caller that won the transition.
    pub(crate) fn begin_close(&self) -> bool {
        loop {
            let current = self.inner.state.load(Ordering::Acquire);
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            if self
                .inner
                .state
                .compare_exchange(
                    current,
                    ConnectionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.inner.state_notify.notify_waiters();
                return true;
            }
        }
    }

    /// Final transition, performed by the supervisor after the disconnect
    /// callback has run.
    pub(crate) fn set_closed(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.inner.state_notify.notify_waiters();
    }

    /// Wait until a close has been requested. Used by the I/O tasks to
    /// observe the close flag between units of work.
    pub(crate) async fn wait_close_requested(&self) {
        loop {
            let notified = self.inner.state_notify.notified();
            if self.state() >= ConnectionState::Closing {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn handler_for(&self, tag: &T::Tag) -> Option<MessageHandlerFn<T>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .stats
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.inner
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .stats
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Dispatch one decoded message to its handler, on the caller's task.
///
/// The handler is cloned out of the table before awaiting, so handlers may
/// edit the table for the next message without deadlocking.
pub(crate) async fn dispatch_message<T: Message>(connection: &Connection<T>, message: T) {
    let tag = message.tag();
    match connection.handler_for(&tag) {
        Some(handler) => handler(connection.clone(), message).await,
        None => {
            connection
                .inner
                .stats
                .unhandled_messages
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                connection = connection.inner.id,
                tag = ?tag,
                "no handler for inbound message, dropping"
            );
        }
    }
}
