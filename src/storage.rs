use crate::error::{Result, TonConnectError};
use crate::types::WalletEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Keys and routing info for one established bridge session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Our NaCl private key, hex.
    pub private_key: String,
    pub bridge_url: String,
    /// The wallet's public key, hex. Set once the wallet has connected.
    #[serde(default)]
    pub wallet_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub session: Session,
    /// Wallet app name this connection belongs to.
    pub source: String,
    /// The `connect` event that completed the handshake.
    #[serde(default)]
    pub connect_event: Option<WalletEvent>,
    #[serde(default)]
    pub last_wallet_event_id: Option<u64>,
    /// Bridge SSE event id to resume from after a restart.
    #[serde(default)]
    pub last_rpc_event_id: Option<u64>,
    #[serde(default)]
    pub next_rpc_request_id: u64,
}

impl Connection {
    pub fn new(session: Session, source: String) -> Self {
        Self {
            session,
            source,
            connect_event: None,
            last_wallet_event_id: None,
            last_rpc_event_id: None,
            next_rpc_request_id: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connect_event.is_some()
    }
}

/// Everything persisted per wallet app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub connection: Option<Connection>,
    /// Unix timestamp of the last bridge heartbeat.
    #[serde(default)]
    pub last_heartbeat: Option<u64>,
}

/// Persistence seam for connection state, keyed by wallet app name.
///
/// The crate ships an in-process [`MemoryStorage`] and a JSON-file-backed
/// [`FileStorage`]; anything else (a document store, a SQL table) is an
/// implementation of this trait away.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Create an entry for `app_name`. Returns
    /// [`TonConnectError::DuplicateEntry`] when one already exists.
    async fn insert(&self, app_name: &str, entry: StorageEntry) -> Result<()>;

    async fn entry(&self, app_name: &str) -> Result<Option<StorageEntry>>;

    async fn connection(&self, app_name: &str) -> Result<Option<Connection>>;

    async fn set_connection(&self, app_name: &str, connection: Connection) -> Result<()>;

    async fn remove_connection(&self, app_name: &str) -> Result<()>;

    async fn set_heartbeat(&self, app_name: &str, timestamp: u64) -> Result<()>;
}

/// In-process storage. Sessions do not survive a restart.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, StorageEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert(&self, app_name: &str, entry: StorageEntry) -> Result<()> {
        match self.entries.entry(app_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TonConnectError::DuplicateEntry {
                app_name: app_name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    async fn entry(&self, app_name: &str) -> Result<Option<StorageEntry>> {
        Ok(self.entries.get(app_name).map(|entry| entry.clone()))
    }

    async fn connection(&self, app_name: &str) -> Result<Option<Connection>> {
        Ok(self
            .entries
            .get(app_name)
            .and_then(|entry| entry.connection.clone()))
    }

    async fn set_connection(&self, app_name: &str, connection: Connection) -> Result<()> {
        self.entries
            .entry(app_name.to_string())
            .or_default()
            .connection = Some(connection);
        Ok(())
    }

    async fn remove_connection(&self, app_name: &str) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(app_name) {
            entry.connection = None;
        }
        Ok(())
    }

    async fn set_heartbeat(&self, app_name: &str, timestamp: u64) -> Result<()> {
        self.entries
            .entry(app_name.to_string())
            .or_default()
            .last_heartbeat = Some(timestamp);
        Ok(())
    }
}

/// Single-document JSON storage on disk. Good enough for CLI tools and bots;
/// writes go through a temp file and a rename.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, StorageEntry>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(error) => Err(TonConnectError::storage(error)),
        }
    }

    async fn save(&self, entries: &HashMap<String, StorageEntry>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(TonConnectError::storage)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(TonConnectError::storage)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn insert(&self, app_name: &str, entry: StorageEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.contains_key(app_name) {
            return Err(TonConnectError::DuplicateEntry {
                app_name: app_name.to_string(),
            });
        }
        entries.insert(app_name.to_string(), entry);
        self.save(&entries).await
    }

    async fn entry(&self, app_name: &str) -> Result<Option<StorageEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(app_name))
    }

    async fn connection(&self, app_name: &str) -> Result<Option<Connection>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .remove(app_name)
            .and_then(|entry| entry.connection))
    }

    async fn set_connection(&self, app_name: &str, connection: Connection) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.entry(app_name.to_string()).or_default().connection = Some(connection);
        self.save(&entries).await
    }

    async fn remove_connection(&self, app_name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if let Some(entry) = entries.get_mut(app_name) {
            entry.connection = None;
        }
        self.save(&entries).await
    }

    async fn set_heartbeat(&self, app_name: &str, timestamp: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries
            .entry(app_name.to_string())
            .or_default()
            .last_heartbeat = Some(timestamp);
        self.save(&entries).await
    }
}
