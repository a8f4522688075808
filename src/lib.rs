//! Typed client/server messaging endpoints over TCP and UDP.
//!
//! An endpoint manages a set of bidirectional connections that carry one
//! application message type, chosen by the caller. Servers accept stream
//! sockets or demultiplex a datagram socket by source address; clients hold
//! one connection at a time. Both sides share the same machinery: a codec
//! registry resolves per-connection encoders and decoders, each connection
//! runs its own send and receive tasks, and inbound messages are dispatched
//! to handlers keyed by a per-type tag.
//!
//! The lifecycle guarantees are the point of the crate:
//!
//! * the connect callback runs to completion before anything is read from
//!   the peer, so handlers installed there never miss a message;
//! * per connection, messages are dispatched one at a time in wire order;
//! * the disconnect callback fires exactly once, after the connection left
//!   the endpoint's list, no matter which side closed or why.
//!
//! ```no_run
//! use netplay::{Client, CodecRegistry, Message, NetConfig, Server};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum Chat {
//!     Hello { name: String },
//!     Line { text: String },
//! }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum ChatTag {
//!     Hello,
//!     Line,
//! }
//!
//! impl Message for Chat {
//!     type Tag = ChatTag;
//!
//!     fn tag(&self) -> ChatTag {
//!         match self {
//!             Chat::Hello { .. } => ChatTag::Hello,
//!             Chat::Line { .. } => ChatTag::Line,
//!         }
//!     }
//! }
//!
//! # async fn run() -> netplay::NetResult<()> {
//! let registry = Arc::new(CodecRegistry::new());
//! registry.register_postcard::<Chat>();
//!
//! let mut server =
//!     Server::<Chat>::bind_tcp("127.0.0.1:0".parse().unwrap(), NetConfig::default(), registry.clone())
//!         .await?;
//! server.set_on_connected(|conn| async move {
//!     conn.add_message_handler(ChatTag::Line, |conn, line| async move {
//!         let _ = conn.send(line).await;
//!     });
//! });
//! server.start();
//!
//! let mut client = Client::<Chat>::new(NetConfig::default(), registry);
//! let conn = client.connect_tcp(server.local_addr()).await?;
//! conn.send(Chat::Line { text: "hi".into() }).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
mod frame;
pub mod replication;
pub mod server;

pub use client::Client;
pub use codec::{CodecRegistry, Decoder, Encoder, PostcardCodec, Protocol};
pub use config::{DropPolicy, NetConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_SEND_QUEUE_CAPACITY};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use endpoint::Endpoint;
pub use error::{NetError, NetResult};
pub use server::Server;

/// Application message type carried by an endpoint.
///
/// The associated [`Message::Tag`] is the dispatch key: handlers are
/// registered per tag and each inbound message is routed by the tag it
/// reports. An enum with one tag per variant is the usual shape, as in
/// [`replication::ReplicationMessage`].
pub trait Message: Send + 'static {
    /// Dispatch key distinguishing the kinds of message.
    type Tag: Copy + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static;

    /// The dispatch key for this message.
    fn tag(&self) -> Self::Tag;
}
