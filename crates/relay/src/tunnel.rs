//! Relay end of CONNECT tunnels.
//!
//! Every incoming end-to-end connection gets a [`RelayTunnel`] listening
//! for tunnel messages. A `connect` dials the requested TCP target,
//! answers with `ack`, and bridges the socket through a
//! [`TunnelConn`]; `data` and `close` land in the matching connection's
//! reorder buffer. A `connect` for an id that is already live is
//! rejected: ids are chosen by the client and a duplicate is a protocol
//! violation, not a replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use mixgate_core::{TunnelCommand, TunnelMessage, TUNNEL_MSG_TYPE};
use mixgate_transport::{ConnectionHandler, E2eConnection, E2eListener, IncomingMessage};
use mixgate_tunnel::TunnelConn;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Accepts incoming connections and hands each one a tunnel listener.
pub struct ConnectServer {
    tunnels: RwLock<Vec<Arc<RelayTunnel>>>,
    next_num: AtomicU32,
}

impl ConnectServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: RwLock::new(Vec::new()),
            next_num: AtomicU32::new(0),
        })
    }

    /// Tear down every tunnel connection.
    pub fn stop_all(&self) {
        for tunnel in self.tunnels.write().drain(..) {
            tunnel.stop_all();
        }
    }
}

impl ConnectionHandler for ConnectServer {
    fn connected(&self, connection: Arc<dyn E2eConnection>) {
        let num = self.next_num.fetch_add(1, Ordering::SeqCst);
        info!(num, sender = %connection.partner(), "connection received over mixnet");
        let tunnel = RelayTunnel::new(connection.clone(), num);
        connection.register_listener(TUNNEL_MSG_TYPE, tunnel.clone());
        self.tunnels.write().push(tunnel);
    }
}

/// All tunnel connections for one client.
pub struct RelayTunnel {
    connection: Arc<dyn E2eConnection>,
    num: u32,
    conns: RwLock<HashMap<u32, Arc<TunnelConn>>>,
    name: String,
    /// Back-reference for handing owned handles to spawned dial tasks;
    /// the listener trait only ever sees `&self`.
    self_ref: Weak<Self>,
}

impl RelayTunnel {
    fn new(connection: Arc<dyn E2eConnection>, num: u32) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            connection,
            num,
            conns: RwLock::new(HashMap::new()),
            name: format!("tunnel-{num}"),
            self_ref: self_ref.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    pub fn stop_all(&self) {
        let conns: Vec<_> = self.conns.write().drain().map(|(_, conn)| conn).collect();
        for conn in conns {
            conn.stop();
        }
    }

    fn remove(&self, id: u32) {
        self.conns.write().remove(&id);
    }

    /// Dial the target and wire up the connection, then ack.
    async fn open_connection(self: Arc<Self>, id: u32, target: String) {
        info!(num = self.num, id, %target, "connecting");
        let stream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(error) => {
                error!(num = self.num, id, %target, %error, "error connecting to target");
                return;
            }
        };

        let tunnel = Arc::downgrade(&self);
        let on_remove = Box::new(move |id: u32| {
            if let Some(tunnel) = tunnel.upgrade() {
                tunnel.remove(id);
            }
        });
        let conn = TunnelConn::new(id, target, self.connection.clone(), stream, on_remove);

        // The id may have raced into use while the dial was in flight.
        {
            let mut conns = self.conns.write();
            if conns.contains_key(&id) {
                warn!(num = self.num, id, "connection id already exists, rejecting");
                conn.stop();
                return;
            }
            conns.insert(id, conn.clone());
        }

        conn.start();
        if let Err(error) = conn.send_ack().await {
            error!(num = self.num, id, %error, "error sending ack");
            conn.stop();
            self.remove(id);
        }
    }
}

impl E2eListener for RelayTunnel {
    fn hear(&self, message: IncomingMessage) {
        debug!(num = self.num, sender = %message.sender, "message received over mixnet");
        let message = match TunnelMessage::decode(&message.payload) {
            Ok(message) => message,
            Err(error) => {
                error!(num = self.num, %error, "error parsing tunnel message");
                return;
            }
        };

        match message.command {
            TunnelCommand::Connect => {
                if self.conns.read().contains_key(&message.id) {
                    warn!(num = self.num, id = message.id, "connection id already exists, rejecting duplicate connect");
                    return;
                }
                let target = String::from_utf8_lossy(&message.data).into_owned();
                let tunnel = self.arc();
                tokio::spawn(tunnel.open_connection(message.id, target));
            }
            TunnelCommand::Data | TunnelCommand::Close => {
                match self.conns.read().get(&message.id) {
                    Some(conn) => conn.enqueue(message),
                    None => {
                        warn!(num = self.num, id = message.id, "connection does not exist");
                    }
                }
            }
            TunnelCommand::Ack => {
                warn!(num = self.num, id = message.id, "unexpected ack from client");
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl RelayTunnel {
    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("tunnel self reference set at construction")
    }
}
