//! End-to-end scenarios for datagram (UDP) endpoints.

use anyhow::Result;
use netplay::replication::{register_replication_codecs, ReplicationMessage, ReplicationTag};
use netplay::{Client, CodecRegistry, Encoder, Message, NetConfig, PostcardCodec, Server};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum GameMessage {
    Hello { player: String },
    Ping(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GameTag {
    Hello,
    Ping,
}

impl Message for GameMessage {
    type Tag = GameTag;

    fn tag(&self) -> GameTag {
        match self {
            GameMessage::Hello { .. } => GameTag::Hello,
            GameMessage::Ping(_) => GameTag::Ping,
        }
    }
}

fn test_registry() -> Arc<CodecRegistry> {
    let registry = Arc::new(CodecRegistry::new());
    registry.register_postcard::<GameMessage>();
    registry
}

fn encode_game_message(message: &GameMessage) -> Vec<u8> {
    let mut codec = PostcardCodec::<GameMessage>::new();
    let mut buf = Vec::new();
    codec.encode(message, &mut buf).expect("encode failed");
    buf
}

async fn bind_server(config: NetConfig, registry: Arc<CodecRegistry>) -> Result<Server<GameMessage>> {
    Ok(Server::bind_udp("127.0.0.1:0".parse()?, config, registry).await?)
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn first_datagram_admits_and_echo_works() -> Result<()> {
    let registry = test_registry();
    let mut server = bind_server(NetConfig::default(), registry.clone()).await?;

    let server_connected = Arc::new(AtomicU64::new(0));
    {
        let connected = server_connected.clone();
        server.set_on_connected(move |conn| {
            connected.fetch_add(1, Ordering::SeqCst);
            async move {
                conn.add_message_handler(GameTag::Ping, |conn, message| async move {
                    let _ = conn.send(message).await;
                });
            }
        });
    }
    server.start();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let mut client = Client::new(NetConfig::default(), registry);
    client.set_on_connected(move |conn| {
        let reply_tx = reply_tx.clone();
        async move {
            conn.add_message_handler(GameTag::Ping, move |_conn, message| {
                let reply_tx = reply_tx.clone();
                async move {
                    let _ = reply_tx.send(message);
                }
            });
        }
    });

    let conn = client.connect_udp(server.local_addr()).await?;
    // Sessionless: the client side is open before the server knows of it.
    assert!(conn.is_connected());
    assert_eq!(server.connections().len(), 0);

    conn.send(GameMessage::Ping(3)).await?;
    let reply = timeout(STEP, reply_rx.recv()).await?.expect("channel closed");
    assert_eq!(reply, GameMessage::Ping(3));
    assert_eq!(server_connected.load(Ordering::SeqCst), 1);
    assert_eq!(server.connections().len(), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_admitted_peer() -> Result<()> {
    let registry = test_registry();
    let mut server = bind_server(NetConfig::default(), registry.clone()).await?;
    server.start();

    let mut clients = Vec::new();
    let mut receivers = Vec::new();
    for index in 0..2u64 {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = Client::new(NetConfig::default(), registry.clone());
        client.set_on_connected(move |conn| {
            let tx = tx.clone();
            async move {
                conn.add_message_handler(GameTag::Ping, move |_conn, message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                    }
                });
            }
        });
        let conn = client.connect_udp(server.local_addr()).await?;
        // Admission happens on the first datagram, so say hello.
        conn.send(GameMessage::Hello {
            player: format!("p{index}"),
        })
        .await?;
        clients.push(client);
        receivers.push(rx);
    }

    let endpoint = server.endpoint().clone();
    wait_for("both peers admitted", move || endpoint.connection_count() == 2).await;

    server.broadcast(GameMessage::Ping(42)).await;
    for rx in &mut receivers {
        let message = timeout(STEP, rx.recv()).await?.expect("channel closed");
        assert_eq!(message, GameMessage::Ping(42));
    }

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idle_datagram_peer_is_swept_out() -> Result<()> {
    let registry = test_registry();
    let config = NetConfig {
        peer_idle_timeout_udp: Some(Duration::from_millis(300)),
        ..NetConfig::default()
    };
    let mut server = bind_server(config, registry.clone()).await?;
    let server_disconnected = Arc::new(AtomicU64::new(0));
    {
        let disconnected = server_disconnected.clone();
        server.set_on_disconnected(move |_conn| {
            disconnected.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    }
    server.start();

    let mut client = Client::new(NetConfig::default(), registry);
    let conn = client.connect_udp(server.local_addr()).await?;
    conn.send(GameMessage::Ping(1)).await?;

    let endpoint = server.endpoint().clone();
    wait_for("admission", move || endpoint.connection_count() == 1).await;

    // Silence. The sweep should close the peer for idleness.
    let disconnected = server_disconnected.clone();
    wait_for("idle disconnect", move || {
        disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(server.connections().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn client_applies_idle_timeout_to_a_silent_server() -> Result<()> {
    let registry = test_registry();
    // No handlers server side: it receives and never answers.
    let mut server = bind_server(NetConfig::default(), registry.clone()).await?;
    server.start();

    let client_disconnected = Arc::new(AtomicU64::new(0));
    let config = NetConfig {
        peer_idle_timeout_udp: Some(Duration::from_millis(200)),
        ..NetConfig::default()
    };
    let mut client = Client::new(config, registry);
    {
        let disconnected = client_disconnected.clone();
        client.set_on_disconnected(move |_conn| {
            disconnected.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    }

    let conn = client.connect_udp(server.local_addr()).await?;
    conn.send(GameMessage::Ping(1)).await?;

    let disconnected = client_disconnected.clone();
    wait_for("client side idle disconnect", move || {
        disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(!conn.is_connected());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn garbage_from_unknown_sources_creates_no_connection() -> Result<()> {
    let registry = test_registry();
    let mut server = bind_server(NetConfig::default(), registry.clone()).await?;
    let server_connected = Arc::new(AtomicU64::new(0));
    {
        let connected = server_connected.clone();
        server.set_on_connected(move |_conn| {
            connected.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    }
    server.start();

    let stranger = UdpSocket::bind("127.0.0.1:0").await?;
    stranger.send_to(&[0xFF; 16], server.local_addr()).await?;
    stranger.send_to(&[0xFF; 16], server.local_addr()).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server_connected.load(Ordering::SeqCst), 0);
    assert!(server.connections().is_empty());

    // The endpoint survived the garbage: a well-formed peer still gets in.
    let valid = encode_game_message(&GameMessage::Ping(5));
    stranger.send_to(&valid, server.local_addr()).await?;
    let connected = server_connected.clone();
    wait_for("admission after garbage", move || {
        connected.load(Ordering::SeqCst) == 1
    })
    .await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_datagram_closes_an_admitted_connection() -> Result<()> {
    let registry = test_registry();
    let mut server = bind_server(NetConfig::default(), registry.clone()).await?;
    let server_disconnected = Arc::new(AtomicU64::new(0));
    {
        let disconnected = server_disconnected.clone();
        server.set_on_disconnected(move |_conn| {
            disconnected.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    }
    server.start();

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let valid = encode_game_message(&GameMessage::Hello {
        player: "peer".into(),
    });
    peer.send_to(&valid, server.local_addr()).await?;

    let endpoint = server.endpoint().clone();
    wait_for("admission", move || endpoint.connection_count() == 1).await;

    // Once admitted, a datagram that fails to decode is fatal for the
    // connection.
    peer.send_to(&[0xFF; 8], server.local_addr()).await?;
    let disconnected = server_disconnected.clone();
    wait_for("close on malformed datagram", move || {
        disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(server.connections().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn replication_ping_pong_over_udp() -> Result<()> {
    let registry = Arc::new(CodecRegistry::new());
    register_replication_codecs(&registry);

    let mut server =
        Server::bind_udp("127.0.0.1:0".parse()?, NetConfig::default(), registry.clone()).await?;
    server.set_on_connected(|conn| async move {
        conn.add_message_handler(ReplicationTag::Ping, |conn, message| async move {
            if let ReplicationMessage::Ping { time_sent_ms } = message {
                let _ = conn
                    .send(ReplicationMessage::Pong {
                        time_sent_ms,
                        time_received_ms: time_sent_ms + 5,
                    })
                    .await;
            }
        });
    });
    server.start();

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let mut client = Client::new(NetConfig::default(), registry);
    client.set_on_connected(move |conn| {
        let pong_tx = pong_tx.clone();
        async move {
            conn.add_message_handler(ReplicationTag::Pong, move |_conn, message| {
                let pong_tx = pong_tx.clone();
                async move {
                    let _ = pong_tx.send(message);
                }
            });
        }
    });

    let conn = client.connect_udp(server.local_addr()).await?;
    conn.send(ReplicationMessage::Ping { time_sent_ms: 100 }).await?;

    let pong = timeout(STEP, pong_rx.recv()).await?.expect("channel closed");
    assert_eq!(
        pong,
        ReplicationMessage::Pong {
            time_sent_ms: 100,
            time_received_ms: 105,
        }
    );

    server.shutdown().await;
    Ok(())
}
