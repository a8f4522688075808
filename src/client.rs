//! Connecting endpoint: manages one outbound connection at a time.

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::NetResult;
use crate::{CodecRegistry, Message, NetConfig};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

/// A client endpoint holding at most one live connection.
///
/// Connecting again replaces the previous connection: the old one is closed
/// and the new one takes its place. Lifecycle callbacks and message handlers
/// work exactly as on the server side; when `connect_tcp` or `connect_udp`
/// returns, the connect callback has already run.
pub struct Client<T: Message> {
    endpoint: Endpoint<T>,
    connection: Option<Connection<T>>,
}

impl<T: Message> Client<T> {
    /// Create an unconnected client.
    pub fn new(config: NetConfig, registry: Arc<CodecRegistry>) -> Self {
        Self {
            endpoint: Endpoint::new("client", config, registry),
            connection: None,
        }
    }

    /// Connect to a stream (TCP) server at `addr`.
    ///
    /// # Errors
    ///
    /// Connection and socket failures as [`crate::NetError::Transport`],
    /// missing codecs as [`crate::NetError::UnregisteredEncoder`] or
    /// [`crate::NetError::UnregisteredDecoder`].
    pub async fn connect_tcp(&mut self, addr: SocketAddr) -> NetResult<Connection<T>> {
        self.replace_existing();
        let socket = TcpStream::connect(addr).await?;
        let connection = self.endpoint.open_stream_connection(socket).await?;
        info!(connection = connection.id(), peer = %addr, "connected over tcp");
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Connect to a datagram (UDP) server at `addr`.
    ///
    /// Datagram connections are sessionless: this returns an open connection
    /// without any exchange with the server, which admits its side once the
    /// first message arrives.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Client::connect_tcp`].
    pub async fn connect_udp(&mut self, addr: SocketAddr) -> NetResult<Connection<T>> {
        self.replace_existing();
        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        let connection = self
            .endpoint
            .open_datagram_direct(Arc::new(socket), addr)
            .await?;
        info!(connection = connection.id(), peer = %addr, "connected over udp");
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// The current connection, if any. It may be mid-close; check
    /// [`Connection::is_connected`] before relying on it.
    pub fn connection(&self) -> Option<Connection<T>> {
        self.connection.clone()
    }

    /// Close the current connection and wait until its disconnect callback
    /// has run. Does nothing when not connected.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            connection.closed().await;
        }
    }

    /// The endpoint behind this client.
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

    fn replace_existing(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_connected() {
                debug!(
                    connection = connection.id(),
                    "replacing existing connection"
                );
                connection.close();
            }
        }
    }
}

impl<T: Message> Drop for Client<T> {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }
}
