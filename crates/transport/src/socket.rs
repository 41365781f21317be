//! Socket transport backend for local development.
//!
//! Carries the transport contract over a plain TCP socket with
//! newline-delimited JSON frames, so the client and relay roles can run as
//! separate processes on one machine. A single-use request is one short
//! connection: one request frame out, one response frame back. An
//! end-to-end connection is a long-lived socket announced with a connect
//! frame, after which message frames flow both ways.
//!
//! This backend provides none of the mixnet's anonymity properties; it
//! exists so the system above it can be exercised without the external
//! mixnet SDK.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mixgate_core::{RequestEnvelope, ResponseEnvelope};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    Contact, ConnectionHandler, E2eConnection, E2eListener, Endpoints, HealthCallback,
    IncomingMessage, MixClient, RestServer, SendReport, TransportError,
};

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Request {
        request: RequestEnvelope,
    },
    Response {
        response: ResponseEnvelope,
    },
    Connect {
        sender: String,
    },
    Message {
        message_type: u8,
        #[serde(with = "mixgate_core::base64_bytes")]
        payload: Vec<u8>,
    },
}

async fn write_frame(writer: &mut (impl AsyncWriteExt + Unpin), frame: &Frame) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame).expect("frame serializes");
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Relay half of the socket backend.
pub struct SocketServer {
    id: String,
    listen_addr: SocketAddr,
    endpoints: Arc<Endpoints>,
    /// Shared with the accept task so handlers registered after start are
    /// still picked up.
    connection_handler: Arc<RwLock<Option<Arc<dyn ConnectionHandler>>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketServer {
    pub fn new(id: impl Into<String>, listen_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            listen_addr,
            endpoints: Endpoints::new(),
            connection_handler: Arc::new(RwLock::new(None)),
            bound_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// The contact clients use to reach this server. Only available after
    /// [`RestServer::start`] has bound the listener.
    pub fn contact(&self) -> Result<Contact, TransportError> {
        let addr = (*self.bound_addr.lock()).ok_or(TransportError::NotStarted)?;
        Ok(Contact::new(&self.id, addr.to_string()))
    }

    async fn serve_connection(
        stream: TcpStream,
        endpoints: Arc<Endpoints>,
        handler: Option<Arc<dyn ConnectionHandler>>,
    ) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%peer, %error, "bad frame");
                return;
            }
        };

        match frame {
            Frame::Request { request } => {
                let uri = request.uri.clone();
                let method = request.method;
                let response = match endpoints.dispatch(request).await {
                    Some(response) => response,
                    None => ResponseEnvelope::error(format!("no handler for {method} {uri}"), 404),
                };
                let mut writer = write_half;
                if let Err(error) = write_frame(&mut writer, &Frame::Response { response }).await {
                    warn!(%peer, %error, "failed to write response frame");
                }
            }
            Frame::Connect { sender } => {
                let Some(handler) = handler else {
                    warn!(%peer, "no connection handler registered, dropping connection");
                    return;
                };
                debug!(%peer, %sender, "incoming connection");
                let connection = SocketConnection::new(sender, write_half);
                connection.clone().spawn_reader(reader);
                handler.connected(connection);
            }
            Frame::Response { .. } | Frame::Message { .. } => {
                warn!(%peer, "unexpected opening frame");
            }
        }
    }
}

#[async_trait]
impl RestServer for SocketServer {
    fn endpoints(&self) -> Arc<Endpoints> {
        self.endpoints.clone()
    }

    fn set_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.connection_handler.write() = Some(handler);
    }

    async fn start(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let bound = listener.local_addr()?;
        *self.bound_addr.lock() = Some(bound);
        info!(id = %self.id, %bound, "socket transport listening");

        let endpoints = self.endpoints.clone();
        let handler_slot = self.connection_handler.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let endpoints = endpoints.clone();
                        let handler = handler_slot.read().clone();
                        tokio::spawn(Self::serve_connection(stream, endpoints, handler));
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        *self.bound_addr.lock() = None;
        info!(id = %self.id, "socket transport stopped");
    }
}

/// Client half of the socket backend.
pub struct SocketClient {
    id: String,
    started: AtomicBool,
    health_callbacks: Mutex<Vec<HealthCallback>>,
}

impl SocketClient {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            started: AtomicBool::new(false),
            health_callbacks: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MixClient for SocketClient {
    async fn start(&self) -> Result<(), TransportError> {
        self.started.store(true, Ordering::SeqCst);
        for callback in self.health_callbacks.lock().iter() {
            callback(true);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for callback in self.health_callbacks.lock().iter() {
            callback(false);
        }
    }

    fn add_health_callback(&self, callback: HealthCallback) {
        self.health_callbacks.lock().push(callback);
    }

    async fn request(
        &self,
        contact: &Contact,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let stream = TcpStream::connect(contact.address())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {e}", contact.id())))?;
        let (read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, &Frame::Request { request }).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        match serde_json::from_str(&line) {
            Ok(Frame::Response { response }) => Ok(response),
            Ok(_) => Err(TransportError::SendFailed(
                "unexpected reply frame".to_string(),
            )),
            Err(error) => Err(TransportError::SendFailed(error.to_string())),
        }
    }

    async fn connect(&self, contact: &Contact) -> Result<Arc<dyn E2eConnection>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let stream = TcpStream::connect(contact.address())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {e}", contact.id())))?;
        let (read_half, mut write_half) = stream.into_split();

        write_frame(
            &mut write_half,
            &Frame::Connect {
                sender: self.id.clone(),
            },
        )
        .await?;

        let connection = SocketConnection::new(contact.id().to_string(), write_half);
        connection.clone().spawn_reader(BufReader::new(read_half));
        Ok(connection)
    }
}

/// One end of a long-lived socket connection carrying message frames.
pub struct SocketConnection {
    partner: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    listeners: RwLock<HashMap<u8, Arc<dyn E2eListener>>>,
    next_message_id: AtomicU64,
}

impl SocketConnection {
    fn new(partner: String, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            partner,
            writer: tokio::sync::Mutex::new(writer),
            listeners: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(0),
        })
    }

    fn spawn_reader(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                match serde_json::from_str(&line) {
                    Ok(Frame::Message {
                        message_type,
                        payload,
                    }) => {
                        let listener = self.listeners.read().get(&message_type).cloned();
                        match listener {
                            Some(listener) => listener.hear(IncomingMessage {
                                sender: self.partner.clone(),
                                payload,
                            }),
                            None => {
                                debug!(message_type, "no listener for message, dropping")
                            }
                        }
                    }
                    Ok(_) => warn!("unexpected frame on connection"),
                    Err(error) => warn!(%error, "bad frame on connection"),
                }
            }
            debug!(partner = %self.partner, "connection reader finished");
        });
    }
}

#[async_trait]
impl E2eConnection for SocketConnection {
    async fn send(&self, message_type: u8, payload: Vec<u8>) -> Result<SendReport, TransportError> {
        let mut writer = self.writer.lock().await;
        write_frame(
            &mut *writer,
            &Frame::Message {
                message_type,
                payload,
            },
        )
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(SendReport {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            rounds: Vec::new(),
        })
    }

    fn register_listener(&self, message_type: u8, listener: Arc<dyn E2eListener>) {
        self.listeners.write().insert(message_type, listener);
    }

    fn partner(&self) -> String {
        self.partner.clone()
    }
}
