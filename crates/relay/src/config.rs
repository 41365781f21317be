//! Networks configuration file and change watcher.
//!
//! The file maps network names to subnets, each with its candidate
//! JSON-RPC endpoints:
//!
//! ```json
//! {
//!   "ethereum": [
//!     { "name": "mainnet", "endpoints": ["https://rpc.example.org"] },
//!     { "name": "goerli",  "endpoints": ["https://goerli.example.org"] }
//!   ]
//! }
//! ```
//!
//! The watcher polls the file's metadata and reloads the registry when it
//! changes, at most once per debounce window. A file that fails to parse
//! is logged and ignored: the running registry stands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::registry::NetworkManager;
use crate::{RelayError, Result};

/// One subnet entry: a name and its candidate endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    pub endpoints: Vec<String>,
}

/// The whole networks file, keyed by network name. Ordered so the
/// registration order is stable across reloads.
pub type NetworksConfig = BTreeMap<String, Vec<SubnetConfig>>;

/// Read and parse the networks file.
pub fn load_networks(path: &Path) -> Result<NetworksConfig> {
    let data = std::fs::read(path).map_err(|error| {
        RelayError::Config(format!("could not open config file {}: {error}", path.display()))
    })?;
    Ok(serde_json::from_slice(&data)?)
}

/// Ignore further changes for this long after a reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(5);

/// How often the file's metadata is checked.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(PartialEq, Eq, Clone, Copy)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

/// Watches the networks file and reloads the registry on writes.
pub struct ConfigWatcher {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigWatcher {
    pub fn spawn(path: PathBuf, manager: Arc<NetworkManager>) -> Self {
        let task = tokio::spawn(Self::watch(path, manager));
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn watch(path: PathBuf, manager: Arc<NetworkManager>) {
        let mut last_stamp = stamp(&path);
        let mut last_reload = tokio::time::Instant::now() - RELOAD_DEBOUNCE;
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = stamp(&path);
            if current == last_stamp {
                continue;
            }
            last_stamp = current;

            if last_reload.elapsed() < RELOAD_DEBOUNCE {
                debug!("config changed within debounce window, ignoring");
                continue;
            }

            info!(path = %path.display(), "reloading networks configuration");
            match load_networks(&path) {
                Err(error) => {
                    error!(%error, "unable to read new networks configuration");
                }
                Ok(config) => {
                    manager.reload(config).await;
                    last_reload = tokio::time::Instant::now();
                }
            }
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
