//! Node configuration backed by a `config.json` file on disk.
//!
//! The configuration directory defaults to `~/.lantern` and can be overridden
//! by the first command line argument. Reads go through a shared lock;
//! setters take the exclusive lock and hand a snapshot to a single writer
//! task, so file writes are totally ordered in submission order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.json";
const SAVE_QUEUE_DEPTH: usize = 100;

/// On-disk shape of the node configuration. Unknown keys are ignored and
/// missing keys fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// host:port of our parent node, or empty if we are a root node.
    #[serde(rename = "ParentAddress")]
    pub parent_address: String,
    /// host:port at which we listen for signaling connections from children.
    #[serde(rename = "SignalingAddress")]
    pub signaling_address: String,
    /// host:port at which we listen for local proxy connections (the browser).
    #[serde(rename = "LocalProxyAddress")]
    pub local_proxy_address: String,
    /// host:port at which we listen for remote proxy connections from peers.
    #[serde(rename = "RemoteProxyAddress")]
    pub remote_proxy_address: String,
    /// Ordered fallback list of upstream proxies to tunnel through.
    #[serde(rename = "StaticProxyAddresses")]
    pub static_proxy_addresses: Vec<String>,
    /// host:port at which the identity page's backend listens.
    #[serde(rename = "UIAddress")]
    pub ui_address: String,
    /// Email address of the user running this node (empty for master nodes).
    #[serde(rename = "Email")]
    pub email: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            parent_address: String::new(),
            signaling_address: ":16100".to_string(),
            local_proxy_address: "127.0.0.1:8080".to_string(),
            remote_proxy_address: ":16200".to_string(),
            static_proxy_addresses: Vec::new(),
            ui_address: "127.0.0.1:16300".to_string(),
            email: String::new(),
        }
    }
}

/// Process-wide typed view of the node settings with serialized write-back.
pub struct ConfigStore {
    dir: PathBuf,
    inner: RwLock<NodeConfig>,
    save_tx: mpsc::Sender<NodeConfig>,
}

impl ConfigStore {
    /// Load the configuration from `<dir>/config.json`, keeping defaults on
    /// any read or parse error, and start the writer task. The initial save
    /// is always issued so defaults materialize on first run.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

        let path = dir.join(CONFIG_FILE);
        let config = match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<NodeConfig>(&data) {
                Ok(config) => {
                    info!("Initializing configuration from: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Unable to load config from {}, keeping defaults: {}",
                        path.display(),
                        e
                    );
                    NodeConfig::default()
                }
            },
            Err(e) => {
                info!(
                    "Unable to find existing {}, keeping defaults: {}",
                    path.display(),
                    e
                );
                NodeConfig::default()
            }
        };

        let (save_tx, save_rx) = mpsc::channel(SAVE_QUEUE_DEPTH);
        let store = Arc::new(Self {
            dir,
            inner: RwLock::new(config),
            save_tx,
        });

        tokio::spawn(saver(path, save_rx));
        store.save();
        Ok(store)
    }

    /// The directory this configuration lives in.
    pub fn config_dir(&self) -> &Path {
        &self.dir
    }

    /// A node is a root node iff it has no parent address configured.
    pub fn is_root_node(&self) -> bool {
        self.read().parent_address.is_empty()
    }

    pub fn parent_address(&self) -> String {
        self.read().parent_address.clone()
    }

    pub fn set_parent_address(&self, parent_address: String) {
        self.write(|c| c.parent_address = parent_address);
    }

    pub fn signaling_address(&self) -> String {
        self.read().signaling_address.clone()
    }

    pub fn set_signaling_address(&self, signaling_address: String) {
        self.write(|c| c.signaling_address = signaling_address);
    }

    pub fn local_proxy_address(&self) -> String {
        self.read().local_proxy_address.clone()
    }

    pub fn set_local_proxy_address(&self, local_proxy_address: String) {
        self.write(|c| c.local_proxy_address = local_proxy_address);
    }

    pub fn remote_proxy_address(&self) -> String {
        self.read().remote_proxy_address.clone()
    }

    pub fn set_remote_proxy_address(&self, remote_proxy_address: String) {
        self.write(|c| c.remote_proxy_address = remote_proxy_address);
    }

    pub fn static_proxy_addresses(&self) -> Vec<String> {
        self.read().static_proxy_addresses.clone()
    }

    pub fn set_static_proxy_addresses(&self, static_proxy_addresses: Vec<String>) {
        self.write(|c| c.static_proxy_addresses = static_proxy_addresses);
    }

    pub fn ui_address(&self) -> String {
        self.read().ui_address.clone()
    }

    pub fn set_ui_address(&self, ui_address: String) {
        self.write(|c| c.ui_address = ui_address);
    }

    pub fn email(&self) -> String {
        self.read().email.clone()
    }

    pub fn set_email(&self, email: String) {
        self.write(|c| c.email = email);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NodeConfig> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, mutate: impl FnOnce(&mut NodeConfig)) {
        {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            mutate(&mut guard);
        }
        self.save();
    }

    /// Submit the current snapshot to the writer task.
    fn save(&self) {
        let snapshot = self.read().clone();
        if self.save_tx.try_send(snapshot).is_err() {
            warn!("Config save queue is full, dropping snapshot");
        }
    }
}

/// Normalize a configured bind address to a socket address. A bare `:port`
/// means all interfaces.
pub fn listen_addr(address: &str) -> Result<std::net::SocketAddr> {
    let full = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    full.parse()
        .with_context(|| format!("Invalid listen address {}", address))
}

/// Writer task: dequeues snapshots and atomically rewrites `config.json`
/// (write to a temp file, then rename over the target).
async fn saver(path: PathBuf, mut save_rx: mpsc::Receiver<NodeConfig>) {
    while let Some(snapshot) = save_rx.recv().await {
        info!("Saving config");
        if let Err(e) = write_config(&path, &snapshot) {
            warn!("Unable to save config to {}: {}", path.display(), e);
        }
    }
}

fn write_config(path: &Path, config: &NodeConfig) -> Result<()> {
    let data = serde_json::to_vec_pretty(config).context("Failed to marshal config to JSON")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
