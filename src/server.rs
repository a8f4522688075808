//! Accepting endpoint: listens on a local address and admits connections.
//!
//! Stream servers accept sockets; one socket is one connection. Datagram
//! servers own a single socket and demultiplex inbound traffic by source
//! address: the first datagram from an unknown source that decodes as a
//! message admits a connection for that source, anything undecodable from a
//! stranger is dropped without a trace of it in the connection list.

use crate::codec::{Decoder, Protocol};
use crate::config::NetConfig;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::NetResult;
use crate::frame::MAX_DATAGRAM_PAYLOAD;
use crate::{CodecRegistry, Message};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often the datagram demultiplexer sweeps its peer table for closed and
/// idle entries.
const PEER_SWEEP_PERIOD: Duration = Duration::from_millis(500);

/// Queue depth between the demultiplexer and each connection's dispatch
/// task. A peer whose handler falls this far behind starts losing datagrams,
/// which is the nature of the transport anyway.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// A bound server endpoint.
///
/// Binding and admitting are separate steps: [`Server::bind_tcp`] or
/// [`Server::bind_udp`] reserves the address and checks codecs, then
/// [`Server::start`] begins admitting connections. Install lifecycle
/// callbacks in between, so the first admitted connection already sees them.
pub struct Server<T: Message> {
    endpoint: Endpoint<T>,
    local_addr: SocketAddr,
    listener: Option<ListenerKind>,
    driver: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

enum ListenerKind {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl<T: Message> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<T: Message> Server<T> {
    /// Bind a stream (TCP) server on `addr`.
    ///
    /// # Errors
    ///
    /// [`crate::NetError::UnregisteredEncoder`] or
    /// [`crate::NetError::UnregisteredDecoder`] if `registry` has no codecs
    /// for `T`, otherwise any bind failure as
    /// [`crate::NetError::Transport`].
    pub async fn bind_tcp(
        addr: SocketAddr,
        config: NetConfig,
        registry: Arc<CodecRegistry>,
    ) -> NetResult<Self> {
        registry.encoder::<T>(Protocol::Tcp)?;
        registry.decoder::<T>()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "server listening on tcp");
        Ok(Self {
            endpoint: Endpoint::new("server", config, registry),
            local_addr,
            listener: Some(ListenerKind::Tcp(listener)),
            driver: None,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Bind a datagram (UDP) server on `addr`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Server::bind_tcp`].
    pub async fn bind_udp(
        addr: SocketAddr,
        config: NetConfig,
        registry: Arc<CodecRegistry>,
    ) -> NetResult<Self> {
        registry.encoder::<T>(Protocol::Udp)?;
        registry.decoder::<T>()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "server listening on udp");
        Ok(Self {
            endpoint: Endpoint::new("server", config, registry),
            local_addr,
            listener: Some(ListenerKind::Udp(socket)),
            driver: None,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Start admitting connections. A second call does nothing.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            warn!("server already started");
            return;
        };
        let endpoint = self.endpoint.clone();
        let shutdown = self.shutdown.clone();
        self.driver = Some(match listener {
            ListenerKind::Tcp(listener) => tokio::spawn(accept_loop(listener, endpoint, shutdown)),
            ListenerKind::Udp(socket) => tokio::spawn(demux_loop(socket, endpoint, shutdown)),
        });
    }

    /// Stop admitting, close every connection, and wait until each one has
    /// run its disconnect callback.
    pub async fn shutdown(&mut self) {
        self.shutdown.notify_one();
        self.listener = None;
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        // Snapshot before closing anything: teardown removes a connection
        // from the list before its disconnect callback runs, so a snapshot
        // taken after close_all can miss one mid-teardown.
        let connections = self.endpoint.connections();
        self.endpoint.close_all();
        for connection in connections {
            connection.closed().await;
        }
        info!(local_addr = %self.local_addr, "server shut down");
    }

    /// Address the server is bound to. Useful with port 0 binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint shared by this server's connections.
    pub fn endpoint(&self) -> &Endpoint<T> {
        &self.endpoint
    }

    /// See [`Endpoint::set_on_connected`].
    pub fn set_on_connected<F, Fut>(&self, callback: F)
    where
        F: Fn(Connection<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.set_on_connected(callback);
    }

    /// See [`Endpoint::set_on_disconnected`].
    pub fn set_on_disconnected<F, Fut>(&self, callback: F)
    where
        F: Fn(Connection<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.set_on_disconnected(callback);
    }

    /// See [`Endpoint::connections`].
    pub fn connections(&self) -> Vec<Connection<T>> {
        self.endpoint.connections()
    }

    /// See [`Endpoint::broadcast`].
    pub async fn broadcast(&self, message: T)
    where
        T: Clone,
    {
        self.endpoint.broadcast(message).await;
    }
}

impl<T: Message> Drop for Server<T> {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
        self.endpoint.close_all();
    }
}

async fn accept_loop<T: Message>(
    listener: TcpListener,
    endpoint: Endpoint<T>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if let Err(error) = endpoint.open_stream_connection(socket).await {
                        warn!(%peer, %error, "failed to open accepted connection");
                    }
                }
                Err(error) => warn!(%error, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

struct PeerEntry<T: Message> {
    connection: Connection<T>,
    inbound: mpsc::Sender<T>,
    decoder: Box<dyn Decoder<T>>,
    last_seen: Instant,
}

async fn demux_loop<T: Message>(
    socket: Arc<UdpSocket>,
    endpoint: Endpoint<T>,
    shutdown: Arc<Notify>,
) {
    let mut peers: HashMap<SocketAddr, PeerEntry<T>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_PAYLOAD];
    let mut sweep = tokio::time::interval(PEER_SWEEP_PERIOD);
    let idle_timeout = endpoint.config().peer_idle_timeout_udp;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = sweep.tick() => sweep_peers(&mut peers, idle_timeout),
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    handle_datagram(&socket, &endpoint, &mut peers, &buf[..len], from).await;
                }
                // Transient per-peer errors (such as an ICMP unreachable on
                // some platforms) must not take the whole endpoint down.
                Err(error) => debug!(%error, "datagram receive failed"),
            },
        }
    }
    debug!("datagram demultiplexer stopped");
}

fn sweep_peers<T: Message>(
    peers: &mut HashMap<SocketAddr, PeerEntry<T>>,
    idle_timeout: Option<Duration>,
) {
    let now = Instant::now();
    peers.retain(|peer, entry| {
        if !entry.connection.is_connected() {
            return false;
        }
        if let Some(idle) = idle_timeout {
            if now.duration_since(entry.last_seen) > idle {
                debug!(
                    connection = entry.connection.id(),
                    %peer,
                    "datagram peer idle timeout"
                );
                entry.connection.close();
                return false;
            }
        }
        true
    });
}

async fn handle_datagram<T: Message>(
    socket: &Arc<UdpSocket>,
    endpoint: &Endpoint<T>,
    peers: &mut HashMap<SocketAddr, PeerEntry<T>>,
    payload: &[u8],
    from: SocketAddr,
) {
    // A closed connection's entry may linger until the next sweep; a fresh
    // datagram from that source readmits it as a new connection.
    if peers
        .get(&from)
        .is_some_and(|entry| !entry.connection.is_connected())
    {
        peers.remove(&from);
    }

    match peers.get_mut(&from) {
        Some(entry) => {
            entry.last_seen = Instant::now();
            match entry.decoder.decode(payload) {
                Ok(message) => {
                    entry.connection.record_received(payload.len());
                    match entry.inbound.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!(
                            connection = entry.connection.id(),
                            "inbound queue full, datagram dropped"
                        ),
                        Err(TrySendError::Closed(_)) => {
                            peers.remove(&from);
                        }
                    }
                }
                Err(error) => {
                    debug!(
                        connection = entry.connection.id(),
                        %from,
                        %error,
                        "malformed datagram, closing connection"
                    );
                    entry.connection.close();
                    peers.remove(&from);
                }
            }
        }
        None => {
            let mut decoder = match endpoint.registry().decoder::<T>() {
                Ok(decoder) => decoder,
                Err(error) => {
                    warn!(%error, "datagram decoder unavailable");
                    return;
                }
            };
            // Admit unknown sources only on a datagram that decodes; stray
            // garbage must not produce connections.
            let message = match decoder.decode(payload) {
                Ok(message) => message,
                Err(error) => {
                    debug!(%from, %error, "undecodable datagram from unknown source, dropped");
                    return;
                }
            };
            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
            let connection = match endpoint
                .open_datagram_demuxed(socket.clone(), from, inbound_rx)
                .await
            {
                Ok(connection) => connection,
                Err(error) => {
                    warn!(%from, %error, "failed to open datagram connection");
                    return;
                }
            };
            connection.record_received(payload.len());
            // The connect callback has finished by now, so handlers it
            // installed see this first message.
            if inbound_tx.try_send(message).is_err() {
                debug!(connection = connection.id(), "inbound queue rejected first datagram");
            }
            peers.insert(
                from,
                PeerEntry {
                    connection,
                    inbound: inbound_tx,
                    decoder,
                    last_seen: Instant::now(),
                },
            );
        }
    }
}
