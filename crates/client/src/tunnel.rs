//! Client end of CONNECT tunnels.
//!
//! One [`TunnelSession`] per relay connection holds every live CONNECT
//! through that relay, keyed by a client-chosen connection id. The
//! session is the mixnet listener for tunnel messages: `ack` starts a
//! waiting connection's pumps, everything else lands in that
//! connection's reorder buffer, including `data` that beats the `ack`
//! through the mixnet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mixgate_core::{TunnelCommand, TunnelMessage, TUNNEL_MSG_TYPE};
use mixgate_transport::{Contact, E2eConnection, E2eListener, IncomingMessage, MixClient};
use mixgate_tunnel::TunnelConn;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::Result;

const ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";
const CONNECT_FAILED: &[u8] = b"HTTP/1.0 500 Internal Server Error\r\n\r\n";

/// All CONNECT tunnels through one relay.
pub struct TunnelSession {
    connection: Arc<dyn E2eConnection>,
    conns: RwLock<HashMap<u32, Arc<TunnelConn>>>,
    next_id: AtomicU32,
}

impl TunnelSession {
    /// Open the end-to-end relay connection and register for tunnel
    /// messages.
    pub async fn open(client: &Arc<dyn MixClient>, contact: &Contact) -> Result<Arc<Self>> {
        let connection = client.connect(contact).await?;
        info!(relay = %connection.partner(), "tunnel connection established");
        let session = Arc::new(Self {
            connection: connection.clone(),
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        });
        connection.register_listener(TUNNEL_MSG_TYPE, session.clone());
        Ok(session)
    }

    /// Handle a CONNECT request: take over `stream`, allocate an id, and
    /// send `connect` towards the relay. The pumps start when the relay's
    /// `ack` arrives.
    pub async fn handle_connect(self: &Arc<Self>, stream: TcpStream, target: String) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(id, %target, "opening tunnel connection");

        let session = Arc::downgrade(self);
        let on_remove = Box::new(move |id: u32| {
            if let Some(session) = session.upgrade() {
                session.remove(id);
            }
        });
        let conn = TunnelConn::new(id, target, self.connection.clone(), stream, on_remove);
        self.conns.write().insert(id, conn.clone());

        if let Err(error) = conn.send_connect().await {
            error!(id, %error, "error sending connect message");
            self.remove(id);
            if let Err(error) = conn.write_plain(CONNECT_FAILED).await {
                debug!(id, %error, "could not report connect failure to local socket");
            }
            conn.stop();
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Tear down every connection without emitting `close` messages.
    pub fn stop_all(&self) {
        let conns: Vec<_> = self.conns.write().drain().map(|(_, conn)| conn).collect();
        for conn in conns {
            conn.stop();
        }
    }

    fn remove(&self, id: u32) {
        self.conns.write().remove(&id);
    }

    fn lookup(&self, id: u32) -> Option<Arc<TunnelConn>> {
        self.conns.read().get(&id).cloned()
    }
}

impl E2eListener for TunnelSession {
    fn hear(&self, message: IncomingMessage) {
        debug!(sender = %message.sender, "tunnel message received");
        let message = match TunnelMessage::decode(&message.payload) {
            Ok(message) => message,
            Err(error) => {
                error!(%error, "error parsing tunnel message");
                return;
            }
        };

        let Some(conn) = self.lookup(message.id) else {
            warn!(id = message.id, "connection does not exist");
            return;
        };

        match message.command {
            TunnelCommand::Ack => {
                info!(id = message.id, "connection accepted");
                tokio::spawn(async move {
                    if let Err(error) = conn.write_plain(ESTABLISHED).await {
                        warn!(id = conn.id(), %error, "failed to confirm CONNECT");
                        conn.stop();
                        return;
                    }
                    conn.start();
                });
            }
            // Buffered by counter even when the pumps have not started
            // yet: data racing ahead of the ack must not be dropped.
            TunnelCommand::Data | TunnelCommand::Close => conn.enqueue(message),
            TunnelCommand::Connect => {
                warn!(id = message.id, "unexpected connect from relay");
            }
        }
    }

    fn name(&self) -> &str {
        "tunnel-session"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixgate_transport::memory::MemoryBroker;
    use mixgate_transport::ConnectionHandler;
    use mixgate_transport::RestServer;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Relay stand-in that records tunnel messages and can reply.
    struct FakeRelay {
        connection: Mutex<Option<Arc<dyn E2eConnection>>>,
        seen: Arc<Mutex<Vec<TunnelMessage>>>,
    }

    struct FakeRelayListener {
        seen: Arc<Mutex<Vec<TunnelMessage>>>,
    }

    impl E2eListener for FakeRelayListener {
        fn hear(&self, message: IncomingMessage) {
            self.seen
                .lock()
                .push(TunnelMessage::decode(&message.payload).unwrap());
        }

        fn name(&self) -> &str {
            "fake-relay"
        }
    }

    impl ConnectionHandler for FakeRelay {
        fn connected(&self, connection: Arc<dyn E2eConnection>) {
            connection.register_listener(
                TUNNEL_MSG_TYPE,
                Arc::new(FakeRelayListener {
                    seen: self.seen.clone(),
                }),
            );
            *self.connection.lock() = Some(connection);
        }
    }

    async fn session_with_fake_relay() -> (Arc<TunnelSession>, Arc<FakeRelay>) {
        let broker = MemoryBroker::new();
        let server = broker.server("relay-0");
        let relay = Arc::new(FakeRelay {
            connection: Mutex::new(None),
            seen: Arc::new(Mutex::new(Vec::new())),
        });
        server.set_connection_handler(relay.clone());

        let client = broker.client();
        client.start().await.unwrap();
        let client: Arc<dyn MixClient> = client;
        let session = TunnelSession::open(&client, &server.contact()).await.unwrap();
        (session, relay)
    }

    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_connect_sends_target_and_ack_writes_established() {
        let (session, relay) = session_with_fake_relay().await;
        let (mut local, proxied) = local_pair().await;

        session
            .handle_connect(proxied, "example.com:443".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let seen = relay.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].command, TunnelCommand::Connect);
            assert_eq!(seen[0].id, 0);
            assert_eq!(seen[0].data, b"example.com:443");
        }

        // Relay acks; the local socket gets the 200 line.
        let relay_conn = relay.connection.lock().clone().unwrap();
        relay_conn
            .send(TUNNEL_MSG_TYPE, TunnelMessage::ack(0).encode())
            .await
            .unwrap();

        let mut buf = [0u8; ESTABLISHED.len()];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, ESTABLISHED);
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_data_before_ack_is_buffered_not_dropped() {
        let (session, relay) = session_with_fake_relay().await;
        let (mut local, proxied) = local_pair().await;

        session
            .handle_connect(proxied, "example.com:443".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let relay_conn = relay.connection.lock().clone().unwrap();
        // Data overtakes the ack through the mixnet.
        relay_conn
            .send(
                TUNNEL_MSG_TYPE,
                TunnelMessage::data(0, 0, b"early".to_vec()).encode(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay_conn
            .send(TUNNEL_MSG_TYPE, TunnelMessage::ack(0).encode())
            .await
            .unwrap();

        let mut buf = [0u8; ESTABLISHED.len() + 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[ESTABLISHED.len()..], b"early");
    }

    #[tokio::test]
    async fn test_ids_increment_per_connect() {
        let (session, relay) = session_with_fake_relay().await;

        for expected in 0..3u32 {
            let (_local, proxied) = local_pair().await;
            session
                .handle_connect(proxied, "example.com:80".to_string())
                .await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(relay.seen.lock().last().unwrap().id, expected);
        }
        assert_eq!(session.len(), 3);
    }

    #[tokio::test]
    async fn test_close_from_relay_tears_connection_down() {
        let (session, relay) = session_with_fake_relay().await;
        let (mut local, proxied) = local_pair().await;

        session
            .handle_connect(proxied, "example.com:80".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let relay_conn = relay.connection.lock().clone().unwrap();
        relay_conn
            .send(TUNNEL_MSG_TYPE, TunnelMessage::ack(0).encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay_conn
            .send(TUNNEL_MSG_TYPE, TunnelMessage::close(0, 0).encode())
            .await
            .unwrap();

        // Local socket sees the 200 line then EOF.
        let mut raw = Vec::new();
        local.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, ESTABLISHED);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_local_eof_emits_close_once() {
        let (session, relay) = session_with_fake_relay().await;
        let (local, proxied) = local_pair().await;

        session
            .handle_connect(proxied, "example.com:80".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let relay_conn = relay.connection.lock().clone().unwrap();
        relay_conn
            .send(TUNNEL_MSG_TYPE, TunnelMessage::ack(0).encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Local application sends a little data, then hangs up.
        {
            let mut local = local;
            local.write_all(b"ping").await.unwrap();
            local.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = relay.seen.lock();
        let closes: Vec<_> = seen
            .iter()
            .filter(|m| m.command == TunnelCommand::Close)
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].counter, 1);
        drop(seen);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_emits_no_close() {
        let (session, relay) = session_with_fake_relay().await;
        let (_local, proxied) = local_pair().await;

        session
            .handle_connect(proxied, "example.com:80".to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.stop_all();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.is_empty());
        let seen = relay.seen.lock();
        assert!(seen.iter().all(|m| m.command != TunnelCommand::Close));
    }
}
