//! Shared accept-loop scaffolding for the local listeners.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{ClientError, Result};

/// Grace period for in-flight connections on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A localhost TCP listener with graceful shutdown. Each accepted
/// connection runs on its own task.
pub(crate) struct LocalServer {
    name: &'static str,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LocalServer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind `127.0.0.1:port` (`port` 0 picks a free one) and start
    /// accepting. Returns the bound address.
    pub async fn start<F, Fut>(&self, port: u16, handle: F) -> Result<SocketAddr>
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!(server = self.name, %addr, "starting HTTP server");

        let shutdown = self.shutdown.clone();
        let active = self.active.clone();
        let handle = Arc::new(handle);
        let name = self.name;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            let guard = ActiveGuard(active.clone());
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                handle(stream).await;
                            });
                        }
                        Err(error) => {
                            warn!(server = name, %error, "accept failed");
                        }
                    }
                }
            }
            info!(server = name, "listener closed");
        });
        *self.task.lock() = Some(task);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Stop accepting and wait for in-flight connections, bounded by the
    /// shutdown grace period.
    pub async fn stop(&self) -> Result<()> {
        info!(server = self.name, "stopping HTTP server");
        self.shutdown.notify_waiters();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(server = self.name, "shutdown deadline exceeded");
                return Err(ClientError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!(server = self.name, "HTTP server stopped");
        Ok(())
    }
}
