//! Per-connection tunnel machinery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use mixgate_core::{TunnelCommand, TunnelMessage, TUNNEL_MSG_TYPE};
use mixgate_transport::E2eConnection;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::TunnelError;

/// Poll period for draining the reorder buffer. Bounds the tail latency a
/// reordered message adds before reaching the TCP socket.
const PROCESS_INTERVAL: Duration = Duration::from_millis(50);

/// TCP read chunk size. Each chunk becomes one mixnet message.
const READ_CHUNK: usize = 4096;

/// Callback removing a finished connection from its session map.
pub type RemoveFn = Box<dyn Fn(u32) + Send + Sync>;

struct Counters {
    /// Next counter to stamp on outbound `data`; the current value rides
    /// on a `close`.
    write_counter: u32,
    /// Next counter expected from the peer.
    read_counter: u32,
    /// Out-of-order messages parked until their counter comes up.
    pending: HashMap<u32, TunnelMessage>,
}

/// One tunnel connection: a TCP socket bridged to counter-stamped mixnet
/// messages.
///
/// Two tasks run per connection once [`start`](TunnelConn::start) is
/// called: a read pump (TCP bytes out as `data` messages) and a process
/// pump (reorder buffer in counter order back onto the TCP socket).
/// Inbound messages may be [`enqueue`](TunnelConn::enqueue)d before the
/// pumps start; they are held in the buffer, not dropped.
pub struct TunnelConn {
    id: u32,
    /// `host:port` this connection targets. Logging and `connect` payload.
    target: String,
    connection: Arc<dyn E2eConnection>,
    stopped: AtomicBool,
    stop_notify: Notify,
    counters: Mutex<Counters>,
    tcp_reader: Mutex<Option<OwnedReadHalf>>,
    tcp_writer: tokio::sync::Mutex<OwnedWriteHalf>,
    on_remove: RemoveFn,
}

impl TunnelConn {
    pub fn new(
        id: u32,
        target: impl Into<String>,
        connection: Arc<dyn E2eConnection>,
        stream: TcpStream,
        on_remove: RemoveFn,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        Arc::new(Self {
            id,
            target: target.into(),
            connection,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            counters: Mutex::new(Counters {
                write_counter: 0,
                read_counter: 0,
                pending: HashMap::new(),
            }),
            tcp_reader: Mutex::new(Some(read_half)),
            tcp_writer: tokio::sync::Mutex::new(write_half),
            on_remove,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::SeqCst)
    }

    /// Spawn the read and process pumps.
    pub fn start(self: &Arc<Self>) {
        let conn = self.clone();
        tokio::spawn(conn.read_loop());
        let conn = self.clone();
        tokio::spawn(conn.process_loop());
    }

    /// Park an inbound message in the reorder buffer.
    pub fn enqueue(&self, message: TunnelMessage) {
        self.counters
            .lock()
            .pending
            .insert(message.counter, message);
    }

    /// Send the opening `connect` carrying the target address.
    pub async fn send_connect(&self) -> Result<(), TunnelError> {
        let message = TunnelMessage::connect(self.id, &self.target);
        self.send_message(&message).await
    }

    /// Send the relay-side `ack` accepting the connection.
    pub async fn send_ack(&self) -> Result<(), TunnelError> {
        self.send_message(&TunnelMessage::ack(self.id)).await
    }

    /// Write bytes straight to the local TCP socket, bypassing the tunnel.
    /// Used for the proxy status lines around CONNECT establishment.
    pub async fn write_plain(&self, bytes: &[u8]) -> Result<(), TunnelError> {
        let mut writer = self.tcp_writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stop the connection: close the TCP socket and silence both pumps.
    /// The read pump observing this must not emit a `close` message.
    pub fn stop(self: &Arc<Self>) {
        self.begin_stop();
    }

    /// Transition into stopped state. Returns false when already stopped.
    fn begin_stop(self: &Arc<Self>) -> bool {
        if self.stopped.swap(true, AtomicOrdering::SeqCst) {
            return false;
        }
        self.stop_notify.notify_waiters();
        let conn = self.clone();
        tokio::spawn(async move {
            let _ = conn.tcp_writer.lock().await.shutdown().await;
        });
        true
    }

    fn remove_from_session(&self) {
        (self.on_remove)(self.id);
    }

    async fn send_message(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        let report = self
            .connection
            .send(TUNNEL_MSG_TYPE, message.encode())
            .await?;
        debug!(
            id = self.id,
            command = ?message.command,
            message_id = report.message_id,
            "tunnel message sent"
        );
        Ok(())
    }

    async fn send_data(&self, bytes: &[u8]) -> Result<(), TunnelError> {
        let counter = {
            let mut counters = self.counters.lock();
            let counter = counters.write_counter;
            counters.write_counter += 1;
            counter
        };
        self.send_message(&TunnelMessage::data(self.id, counter, bytes.to_vec()))
            .await
    }

    /// TCP → mixnet. Exits on EOF, read error, send failure, or stop.
    async fn read_loop(self: Arc<Self>) {
        let Some(mut reader) = self.tcp_reader.lock().take() else {
            return;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(error) = self.send_data(&buf[..n]).await {
                            warn!(id = self.id, target = %self.target, %error, "tunnel send failed");
                            break;
                        }
                    }
                    Err(error) => {
                        if self.is_stopped() {
                            return;
                        }
                        warn!(id = self.id, target = %self.target, %error, "tcp read failed");
                        break;
                    }
                },
            }
        }

        // The socket is gone. Tell the peer, unless stop() got here first.
        if self.begin_stop() {
            let counter = self.counters.lock().write_counter;
            let close = TunnelMessage::close(self.id, counter);
            if let Err(error) = self.send_message(&close).await {
                warn!(id = self.id, %error, "failed to send close");
            }
            self.remove_from_session();
        }
    }

    /// Mixnet reorder buffer → TCP, strictly in counter order.
    async fn process_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PROCESS_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_stopped() {
                return;
            }

            let ready = {
                let mut counters = self.counters.lock();
                let state = &mut *counters;
                let mut batch = Vec::new();
                while let Some(message) = state.pending.remove(&state.read_counter) {
                    state.read_counter += 1;
                    let is_close = message.command == TunnelCommand::Close;
                    batch.push(message);
                    if is_close {
                        break;
                    }
                }
                batch
            };

            for message in ready {
                match message.command {
                    TunnelCommand::Data => {
                        let mut writer = self.tcp_writer.lock().await;
                        if let Err(error) = writer.write_all(&message.data).await {
                            drop(writer);
                            warn!(id = self.id, %error, "tcp write failed");
                            self.begin_stop();
                            self.remove_from_session();
                            return;
                        }
                    }
                    TunnelCommand::Close => {
                        debug!(id = self.id, "peer closed tunnel connection");
                        self.begin_stop();
                        self.remove_from_session();
                        return;
                    }
                    TunnelCommand::Connect | TunnelCommand::Ack => {
                        warn!(id = self.id, command = ?message.command, "unexpected buffered command");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mixgate_transport::{E2eListener, IncomingMessage, SendReport, TransportError};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Records every sent tunnel message instead of delivering it.
    struct RecordingConnection {
        sent: Mutex<Vec<TunnelMessage>>,
        fail: AtomicBool,
    }

    impl RecordingConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<TunnelMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl E2eConnection for RecordingConnection {
        async fn send(
            &self,
            _message_type: u8,
            payload: Vec<u8>,
        ) -> Result<SendReport, TransportError> {
            if self.fail.load(AtomicOrdering::SeqCst) {
                return Err(TransportError::SendFailed("injected".to_string()));
            }
            self.sent.lock().push(TunnelMessage::decode(&payload).unwrap());
            Ok(SendReport::default())
        }

        fn register_listener(&self, _message_type: u8, _listener: Arc<dyn E2eListener>) {}

        fn partner(&self) -> String {
            "test-peer".to_string()
        }
    }

    /// A connected local TCP pair: (tunnel side, peer side).
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn removal_counter() -> (RemoveFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        (
            Box::new(move |_id| {
                captured.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test]
    async fn test_reordered_data_reaches_tcp_in_counter_order() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, _) = removal_counter();
        let conn = TunnelConn::new(0, "example.com:443", transport, tunnel_side, on_remove);

        // Counters arrive as a permutation: 2, 0, 1.
        conn.enqueue(TunnelMessage::data(0, 2, b"c".to_vec()));
        conn.enqueue(TunnelMessage::data(0, 0, b"a".to_vec()));
        conn.enqueue(TunnelMessage::data(0, 1, b"b".to_vec()));
        conn.start();

        let mut received = [0u8; 3];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"abc");
    }

    #[tokio::test]
    async fn test_messages_enqueued_before_start_are_kept() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, _) = removal_counter();
        let conn = TunnelConn::new(4, "example.com:80", transport, tunnel_side, on_remove);

        conn.enqueue(TunnelMessage::data(4, 0, b"early".to_vec()));
        tokio::time::sleep(Duration::from_millis(80)).await;
        conn.start();

        let mut received = [0u8; 5];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"early");
    }

    #[tokio::test]
    async fn test_tcp_bytes_become_counted_data_messages() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, _) = removal_counter();
        let conn = TunnelConn::new(1, "example.com:80", transport.clone(), tunnel_side, on_remove);
        conn.start();

        peer.write_all(b"first").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.write_all(b"second").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].command, TunnelCommand::Data);
        assert_eq!(sent[0].counter, 0);
        assert_eq!(sent[0].data, b"first");
        assert_eq!(sent[1].counter, 1);
        assert_eq!(sent[1].data, b"second");
    }

    #[tokio::test]
    async fn test_tcp_eof_sends_close_with_current_counter() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, removals) = removal_counter();
        let conn = TunnelConn::new(2, "example.com:80", transport.clone(), tunnel_side, on_remove);
        conn.start();

        peer.write_all(b"payload").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = transport.sent();
        assert_eq!(sent.last().unwrap().command, TunnelCommand::Close);
        assert_eq!(sent.last().unwrap().counter, 1);
        assert!(conn.is_stopped());
        assert_eq!(removals.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_suppresses_close_message() {
        let (tunnel_side, _peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, removals) = removal_counter();
        let conn = TunnelConn::new(3, "example.com:80", transport.clone(), tunnel_side, on_remove);
        conn.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(transport.sent().is_empty());
        assert_eq!(removals.load(AtomicOrdering::SeqCst), 0);
        assert!(conn.is_stopped());
    }

    #[tokio::test]
    async fn test_close_message_closes_tcp_and_removes() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, removals) = removal_counter();
        let conn = TunnelConn::new(5, "example.com:80", transport.clone(), tunnel_side, on_remove);

        conn.enqueue(TunnelMessage::data(5, 0, b"bye".to_vec()));
        conn.enqueue(TunnelMessage::close(5, 1));
        conn.start();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.is_stopped());
        assert_eq!(removals.load(AtomicOrdering::SeqCst), 1);
        // Closed by the peer: no close message echoed back.
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_tears_connection_down() {
        let (tunnel_side, mut peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        transport.fail.store(true, AtomicOrdering::SeqCst);
        let (on_remove, removals) = removal_counter();
        let conn = TunnelConn::new(6, "example.com:80", transport.clone(), tunnel_side, on_remove);
        conn.start();

        peer.write_all(b"doomed").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(conn.is_stopped());
        assert_eq!(removals.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_and_ack_payloads() {
        let (tunnel_side, _peer) = tcp_pair().await;
        let transport = RecordingConnection::new();
        let (on_remove, _) = removal_counter();
        let conn = TunnelConn::new(9, "example.com:443", transport.clone(), tunnel_side, on_remove);

        conn.send_connect().await.unwrap();
        conn.send_ack().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].command, TunnelCommand::Connect);
        assert_eq!(sent[0].data, b"example.com:443");
        assert_eq!(sent[1].command, TunnelCommand::Ack);
        assert_eq!(sent[1].id, 9);
    }
}
