//! Supervision of a set of connections and their I/O tasks.
//!
//! Every connection goes through the same admission sequence regardless of
//! transport or side: resolve codecs, add the connection to the list, run the
//! connect callback to completion, then start the I/O tasks. Because no task
//! reads from the peer before the callback finishes, handlers installed
//! inside it are guaranteed to see the very first inbound message.
//!
//! Teardown mirrors it: a supervisor task joins both I/O tasks, removes the
//! connection from the list, runs the disconnect callback exactly once, and
//! only then marks the connection closed.

use crate::codec::{CodecRegistry, Decoder, Encoder, Protocol};
use crate::config::NetConfig;
use crate::connection::{dispatch_message, BoxFuture, Connection, DatagramQueue};
use crate::error::NetResult;
use crate::frame::{read_frame, write_frame, LENGTH_PREFIX_LEN, MAX_DATAGRAM_PAYLOAD};
use crate::Message;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

pub(crate) type LifecycleCallbackFn<T> = Arc<dyn Fn(Connection<T>) -> BoxFuture + Send + Sync>;

/// Connection list plus the number allocator, guarded together so connection
/// numbers are strictly increasing in admission order.
struct Roster<T: Message> {
    connections: Vec<Connection<T>>,
    next_connection_id: u64,
}

struct EndpointShared<T: Message> {
    label: &'static str,
    config: NetConfig,
    registry: Arc<CodecRegistry>,
    roster: Mutex<Roster<T>>,
    on_connected: RwLock<Option<LifecycleCallbackFn<T>>>,
    on_disconnected: RwLock<Option<LifecycleCallbackFn<T>>>,
}

/// Shared supervisor for a set of connections with one configuration and
/// codec registry.
///
/// [`Server`](crate::Server) and [`Client`](crate::Client) each own one and
/// forward the common operations; this handle is what their callbacks and
/// background tasks share. Cloning is cheap and clones refer to the same
/// endpoint.
pub struct Endpoint<T: Message> {
    inner: Arc<EndpointShared<T>>,
}

impl<T: Message> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Message> std::fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.inner.label)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl<T: Message> Endpoint<T> {
    pub(crate) fn new(
        label: &'static str,
        config: NetConfig,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointShared {
                label,
                config,
                registry,
                roster: Mutex::new(Roster {
                    connections: Vec::new(),
                    next_connection_id: 1,
                }),
                on_connected: RwLock::new(None),
                on_disconnected: RwLock::new(None),
            }),
        }
    }

    /// The configuration every connection of this endpoint runs with.
    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    pub(crate) fn registry(&self) -> &Arc<CodecRegistry> {
        &self.inner.registry
    }

    /// Install the callback fired once per connection, right after it joins
    /// the connection list and before its I/O tasks start.
    ///
    /// This is the place to install message handlers and send initial
    /// messages: both happen before anything is read from the peer.
    /// Replaces any previous callback; install it before the endpoint starts
    /// admitting connections.
    pub fn set_on_connected<F, Fut>(&self, callback: F)
    where
        F: Fn(Connection<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: LifecycleCallbackFn<T> = Arc::new(move |connection| {
            let fut: BoxFuture = Box::pin(callback(connection));
            fut
        });
        *self
            .inner
            .on_connected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Install the callback fired exactly once when a connection is fully
    /// closed, after its I/O tasks finished and it left the connection list.
    ///
    /// Fires no matter which side closed or why. Replaces any previous
    /// callback.
    pub fn set_on_disconnected<F, Fut>(&self, callback: F)
    where
        F: Fn(Connection<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: LifecycleCallbackFn<T> = Arc::new(move |connection| {
            let fut: BoxFuture = Box::pin(callback(connection));
            fut
        });
        *self
            .inner
            .on_disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Snapshot of the currently admitted connections.
    ///
    /// The snapshot is yours: connections admitted or closed afterwards do
    /// not show up in it.
    pub fn connections(&self) -> Vec<Connection<T>> {
        self.inner
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .clone()
    }

    /// Number of currently admitted connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    /// Queue `message` on every connection admitted at the time of the call.
    ///
    /// Connections that close between the snapshot and the queueing simply
    /// drop the message.
    pub async fn broadcast(&self, message: T)
    where
        T: Clone,
    {
        let snapshot = self.connections();
        trace!(
            endpoint = self.inner.label,
            recipients = snapshot.len(),
            "broadcast"
        );
        for connection in snapshot {
            let _ = connection.send(message.clone()).await;
        }
    }

    pub(crate) fn close_all(&self) {
        for connection in self.connections() {
            connection.close();
        }
    }

    /// Admission sequence for an established stream socket.
    ///
    /// # Errors
    ///
    /// Codec lookup failures and socket option errors surface here, before
    /// the connection exists anywhere.
    pub(crate) async fn open_stream_connection(
        &self,
        socket: TcpStream,
    ) -> NetResult<Connection<T>> {
        socket.set_nodelay(self.inner.config.tcp_no_delay)?;
        let peer = socket.peer_addr()?;
        // Resolve codecs before admission so a missing registration surfaces
        // to the connect or accept caller instead of a half-open connection.
        let encoder = self.inner.registry.encoder::<T>(Protocol::Tcp)?;
        let decoder = self.inner.registry.decoder::<T>()?;

        let (read_half, write_half) = socket.into_split();
        let (sender, outbound) =
            mpsc::channel(self.inner.config.effective_send_queue_capacity());
        let connection = self.admit(|id| Connection::new_stream(id, peer, sender));
        debug!(
            endpoint = self.inner.label,
            connection = connection.id(),
            peer = %peer,
            "stream connection admitted"
        );
        connection.set_open();
        self.fire_on_connected(connection.clone()).await;

        let max_frame_len = self.inner.config.max_frame_len;
        let send_task = tokio::spawn(stream_send_loop(
            connection.clone(),
            outbound,
            BufWriter::new(write_half),
            encoder,
            max_frame_len,
        ));
        let recv_task = tokio::spawn(stream_recv_loop(
            connection.clone(),
            BufReader::new(read_half),
            decoder,
            max_frame_len,
        ));
        self.spawn_supervisor(connection.clone(), send_task, recv_task);
        Ok(connection)
    }

    /// Admission sequence for a datagram peer whose inbound traffic arrives
    /// through a server-side demultiplexer.
    pub(crate) async fn open_datagram_demuxed(
        &self,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: mpsc::Receiver<T>,
    ) -> NetResult<Connection<T>> {
        let encoder = self.inner.registry.encoder::<T>(Protocol::Udp)?;
        let (connection, queue) = self.admit_datagram(peer).await;
        let send_task = tokio::spawn(datagram_send_loop(
            connection.clone(),
            queue,
            DatagramSink::ToPeer { socket, peer },
            encoder,
        ));
        let recv_task = tokio::spawn(datagram_dispatch_loop(connection.clone(), inbound));
        self.spawn_supervisor(connection.clone(), send_task, recv_task);
        Ok(connection)
    }

    /// Admission sequence for a client-side datagram socket connected to one
    /// peer.
    pub(crate) async fn open_datagram_direct(
        &self,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> NetResult<Connection<T>> {
        let encoder = self.inner.registry.encoder::<T>(Protocol::Udp)?;
        let decoder = self.inner.registry.decoder::<T>()?;
        let (connection, queue) = self.admit_datagram(peer).await;
        let send_task = tokio::spawn(datagram_send_loop(
            connection.clone(),
            queue,
            DatagramSink::Connected(socket.clone()),
            encoder,
        ));
        let recv_task = tokio::spawn(datagram_recv_loop(
            connection.clone(),
            socket,
            decoder,
            self.inner.config.peer_idle_timeout_udp,
        ));
        self.spawn_supervisor(connection.clone(), send_task, recv_task);
        Ok(connection)
    }

    fn admit(&self, build: impl FnOnce(u64) -> Connection<T>) -> Connection<T> {
        let mut roster = self
            .inner
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = roster.next_connection_id;
        roster.next_connection_id += 1;
        let connection = build(id);
        roster.connections.push(connection.clone());
        connection
    }

    async fn admit_datagram(&self, peer: SocketAddr) -> (Connection<T>, Arc<DatagramQueue<T>>) {
        let queue = Arc::new(DatagramQueue::new(
            self.inner.config.effective_send_queue_capacity(),
            self.inner.config.drop_policy_udp,
        ));
        let connection = {
            let queue = queue.clone();
            self.admit(|id| Connection::new_datagram(id, peer, queue))
        };
        debug!(
            endpoint = self.inner.label,
            connection = connection.id(),
            peer = %peer,
            "datagram connection admitted"
        );
        connection.set_open();
        self.fire_on_connected(connection.clone()).await;
        (connection, queue)
    }

    async fn fire_on_connected(&self, connection: Connection<T>) {
        let callback = self
            .inner
            .on_connected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(connection).await;
        }
    }

    async fn fire_on_disconnected(&self, connection: Connection<T>) {
        let callback = self
            .inner
            .on_disconnected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(connection).await;
        }
    }

    /// Join both I/O tasks, then run the close sequence exactly once.
    fn spawn_supervisor(
        &self,
        connection: Connection<T>,
        send_task: JoinHandle<()>,
        recv_task: JoinHandle<()>,
    ) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let _ = recv_task.await;
            // The receive side is done; make sure a still-parked send task
            // sees the close request and winds down too.
            connection.begin_close();
            let _ = send_task.await;
            endpoint.finish_close(&connection).await;
        });
    }

    async fn finish_close(&self, connection: &Connection<T>) {
        let present = {
            let mut roster = self
                .inner
                .roster
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match roster.connections.iter().position(|c| c == connection) {
                Some(index) => {
                    roster.connections.remove(index);
                    true
                }
                None => false,
            }
        };
        debug!(
            endpoint = self.inner.label,
            connection = connection.id(),
            peer = %connection.peer_addr(),
            "connection closed"
        );
        if present {
            self.fire_on_disconnected(connection.clone()).await;
        }
        connection.set_closed();
    }
}

enum DatagramSink {
    /// Client side: the socket is connected to the peer.
    Connected(Arc<UdpSocket>),
    /// Server side: one shared socket serves every peer.
    ToPeer {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

async fn stream_send_loop<T, W>(
    connection: Connection<T>,
    mut outbound: mpsc::Receiver<T>,
    mut writer: W,
    mut encoder: Box<dyn Encoder<T>>,
    max_frame_len: u32,
) where
    T: Message,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = Vec::new();
    loop {
        let message = tokio::select! {
            _ = connection.wait_close_requested() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        buf.clear();
        if let Err(error) = encoder.encode(&message, &mut buf) {
            debug!(connection = connection.id(), %error, "failed to encode outbound message");
            break;
        }
        // The write must stay cancellable too: a peer that stops reading
        // fills the transport buffers and parks this task mid-frame, and a
        // close request has to be able to unblock it.
        let written = tokio::select! {
            _ = connection.wait_close_requested() => break,
            written = write_frame(&mut writer, &buf, max_frame_len) => written,
        };
        if let Err(error) = written {
            debug!(connection = connection.id(), %error, "stream send failed");
            break;
        }
        connection.record_sent(buf.len() + LENGTH_PREFIX_LEN);
    }
    connection.begin_close();
}

async fn stream_recv_loop<T, R>(
    connection: Connection<T>,
    mut reader: R,
    mut decoder: Box<dyn Decoder<T>>,
    max_frame_len: u32,
) where
    T: Message,
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = Vec::new();
    loop {
        let result = tokio::select! {
            _ = connection.wait_close_requested() => break,
            result = read_frame(&mut reader, max_frame_len, &mut buf) => result,
        };
        match result {
            Ok(()) => match decoder.decode(&buf) {
                Ok(message) => {
                    connection.record_received(buf.len() + LENGTH_PREFIX_LEN);
                    // A close requested while the frame was in flight stops
                    // dispatch here.
                    if !connection.is_connected() {
                        break;
                    }
                    dispatch_message(&connection, message).await;
                }
                Err(error) => {
                    debug!(connection = connection.id(), %error, "failed to decode inbound message");
                    break;
                }
            },
            Err(error) if error.is_clean_close() => {
                debug!(
                    connection = connection.id(),
                    peer = %connection.peer_addr(),
                    "peer closed the stream"
                );
                break;
            }
            Err(error) => {
                debug!(connection = connection.id(), %error, "stream receive failed");
                break;
            }
        }
    }
    connection.begin_close();
}

async fn datagram_send_loop<T: Message>(
    connection: Connection<T>,
    queue: Arc<DatagramQueue<T>>,
    sink: DatagramSink,
    mut encoder: Box<dyn Encoder<T>>,
) {
    let mut buf = Vec::new();
    loop {
        let message = tokio::select! {
            _ = connection.wait_close_requested() => break,
            message = queue.pop() => message,
        };
        buf.clear();
        if let Err(error) = encoder.encode(&message, &mut buf) {
            debug!(connection = connection.id(), %error, "failed to encode outbound message");
            break;
        }
        if buf.len() > MAX_DATAGRAM_PAYLOAD {
            debug!(
                connection = connection.id(),
                size = buf.len(),
                "message exceeds the datagram payload limit"
            );
            break;
        }
        let result = match &sink {
            DatagramSink::Connected(socket) => socket.send(&buf).await,
            DatagramSink::ToPeer { socket, peer } => socket.send_to(&buf, *peer).await,
        };
        match result {
            Ok(_) => connection.record_sent(buf.len()),
            Err(error) => {
                debug!(connection = connection.id(), %error, "datagram send failed");
                break;
            }
        }
    }
    connection.begin_close();
}

/// Receive side of a demultiplexed datagram connection: drains the queue the
/// demultiplexer fills, so one peer's slow handler never stalls the others.
async fn datagram_dispatch_loop<T: Message>(
    connection: Connection<T>,
    mut inbound: mpsc::Receiver<T>,
) {
    loop {
        let message = tokio::select! {
            _ = connection.wait_close_requested() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if !connection.is_connected() {
            break;
        }
        dispatch_message(&connection, message).await;
    }
    connection.begin_close();
}

/// Receive side of a client datagram connection reading its own socket.
async fn datagram_recv_loop<T: Message>(
    connection: Connection<T>,
    socket: Arc<UdpSocket>,
    mut decoder: Box<dyn Decoder<T>>,
    idle_timeout: Option<Duration>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_PAYLOAD];
    let idle = idle_timeout.unwrap_or(Duration::MAX);
    loop {
        let received = tokio::select! {
            _ = connection.wait_close_requested() => break,
            received = socket.recv(&mut buf) => received,
            _ = sleep(idle), if idle_timeout.is_some() => {
                debug!(
                    connection = connection.id(),
                    peer = %connection.peer_addr(),
                    "datagram peer idle timeout"
                );
                break;
            }
        };
        match received {
            Ok(len) => match decoder.decode(&buf[..len]) {
                Ok(message) => {
                    connection.record_received(len);
                    if !connection.is_connected() {
                        break;
                    }
                    dispatch_message(&connection, message).await;
                }
                Err(error) => {
                    debug!(connection = connection.id(), %error, "malformed datagram, closing");
                    break;
                }
            },
            Err(error) => {
                debug!(connection = connection.id(), %error, "datagram receive failed");
                break;
            }
        }
    }
    connection.begin_close();
}
