use crate::bridge::{Bridge, BridgeEvent, BridgeMessage};
use crate::crypto::SessionCrypto;
use crate::error::{Result, TonConnectError};
use crate::storage::{Connection, Session, Storage, StorageEntry};
use crate::types::{
    AppRequest, ConnectItem, ConnectRequest, RpcReply, SendTransactionPayload, SignDataPayload,
    WalletEvent, WalletEventBody, WalletEventKind, WalletMessage,
};
use crate::wallets::{WalletApp, WalletFilter, WalletsList};
use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Bridge TTL for outgoing RPC requests, and how long we wait for the
/// wallet's reply before giving up.
const RPC_TTL_SECS: u64 = 5 * 60;

pub type EventHandler = Box<dyn Fn(WalletEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// App-side TON Connect client.
///
/// One instance manages any number of wallet connections, each backed by its
/// own encrypted [`Bridge`] subscription. All bridges feed a single queue
/// drained by one listener task, which updates storage and dispatches events
/// to handlers registered with [`TonConnect::listen`].
pub struct TonConnect {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    manifest_url: String,
    storage: Arc<dyn Storage>,
    client: reqwest::Client,
    wallets: WalletsList,
    bridges: Mutex<HashMap<String, Bridge>>,
    queue_tx: mpsc::UnboundedSender<BridgeMessage>,
    /// Taken by the listener task on first use.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeMessage>>>,
    listeners: DashMap<WalletEventKind, EventHandler>,
    /// Pending RPC calls. Request ids are per-connection counters, so the
    /// key must carry the app name too.
    waiters: DashMap<(String, String), oneshot::Sender<RpcReply>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TonConnect {
    /// `manifest_url` points at this app's published
    /// `tonconnect-manifest.json`; wallets show its metadata to the user.
    pub fn new(manifest_url: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self::with_client(manifest_url, storage, reqwest::Client::new())
    }

    pub fn with_client(
        manifest_url: impl Into<String>,
        storage: Arc<dyn Storage>,
        client: reqwest::Client,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                manifest_url: manifest_url.into(),
                storage,
                wallets: WalletsList::new(client.clone()),
                client,
                bridges: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                listeners: DashMap::new(),
                waiters: DashMap::new(),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn wallets(&self) -> &WalletsList {
        &self.inner.wallets
    }

    /// Wallet apps from the canonical wallets list, filtered.
    pub async fn get_wallets(&self, filter: &WalletFilter) -> Result<Vec<WalletApp>> {
        self.inner.wallets.filtered(filter).await
    }

    /// Start a new connection to `wallet` and return the universal URL the
    /// user opens (or scans) to approve it. Fails with
    /// [`TonConnectError::ConnectionExists`] when a completed connection is
    /// already stored; use [`TonConnect::restore_connection`] for those.
    pub async fn connect(&self, wallet: &WalletApp, ton_proof: Option<String>) -> Result<String> {
        self.ensure_listener().await;

        let app_name = wallet.app_name.clone();
        let bridge_url = wallet
            .bridge_url()
            .ok_or_else(|| TonConnectError::UnsupportedWallet {
                app_name: app_name.clone(),
            })?
            .to_string();

        let mut bridges = self.inner.bridges.lock().await;

        match self
            .inner
            .storage
            .insert(&app_name, StorageEntry::default())
            .await
        {
            Ok(()) | Err(TonConnectError::DuplicateEntry { .. }) => {}
            Err(e) => return Err(e),
        }

        if let Some(previous) = bridges.remove(&app_name) {
            previous.disconnect();
        }

        if let Some(connection) = self.inner.storage.connection(&app_name).await? {
            if connection.is_connected() {
                return Err(TonConnectError::ConnectionExists);
            }
        }

        let bridge = Bridge::new(
            app_name.clone(),
            self.inner.client.clone(),
            self.inner.queue_tx.clone(),
            bridge_url,
            wallet.universal_url.clone(),
            SessionCrypto::generate(),
            None,
        );
        bridge.subscribe().await?;

        let session = Session {
            private_key: bridge.session_private_key_hex(),
            bridge_url: bridge.bridge_url().to_string(),
            wallet_key: None,
        };
        self.inner
            .storage
            .set_connection(&app_name, Connection::new(session, app_name.clone()))
            .await?;

        let mut items = vec![ConnectItem::TonAddr];
        if let Some(payload) = ton_proof {
            items.push(ConnectItem::TonProof { payload });
        }
        let request = ConnectRequest {
            manifest_url: self.inner.manifest_url.clone(),
            items,
        };
        let url = bridge.connect_url(&request)?;

        // Session is persisted, events may flow now.
        bridge.open_gate();
        bridges.insert(app_name, bridge);
        Ok(url)
    }

    /// Bring a stored connection back up after a restart. Returns `false`
    /// when nothing is stored for `app_name`.
    pub async fn restore_connection(&self, app_name: &str) -> Result<bool> {
        self.ensure_listener().await;

        let mut bridges = self.inner.bridges.lock().await;

        let Some(connection) = self.inner.storage.connection(app_name).await? else {
            return Ok(false);
        };
        if connection.session.bridge_url.is_empty() {
            return Err(TonConnectError::BadConnection {
                error: "stored session has no bridge url".to_string(),
            });
        }

        let crypto = SessionCrypto::from_private_hex(&connection.session.private_key)?;
        let bridge = Bridge::new(
            app_name.to_string(),
            self.inner.client.clone(),
            self.inner.queue_tx.clone(),
            connection.session.bridge_url.clone(),
            None,
            crypto,
            connection.last_rpc_event_id,
        );
        bridge.subscribe().await?;
        bridge.open_gate();

        if let Some(previous) = bridges.insert(app_name.to_string(), bridge) {
            previous.disconnect();
        }
        Ok(true)
    }

    /// Register the handler for one kind of wallet event. At most one handler
    /// per kind.
    pub async fn listen<F, Fut>(&self, kind: WalletEventKind, handler: F) -> Result<()>
    where
        F: Fn(WalletEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_listener().await;
        match self.inner.listeners.entry(kind) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TonConnectError::ListenerExists(kind))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Box::new(move |event| -> BoxFuture<'static, ()> {
                    Box::pin(handler(event))
                }));
                Ok(())
            }
        }
    }

    pub async fn send_transaction(
        &self,
        app_name: &str,
        payload: &SendTransactionPayload,
    ) -> Result<RpcReply> {
        self.send(app_name, AppRequest::send_transaction(payload)?)
            .await
    }

    pub async fn sign_data(&self, app_name: &str, payload: &SignDataPayload) -> Result<RpcReply> {
        self.send(app_name, AppRequest::sign_data(payload)?).await
    }

    /// Send an RPC request to the connected wallet and wait for its reply.
    pub async fn send(&self, app_name: &str, mut request: AppRequest) -> Result<RpcReply> {
        let (request_id, reply_rx) = {
            let bridges = self.inner.bridges.lock().await;
            let bridge = bridges
                .get(app_name)
                .ok_or_else(|| TonConnectError::BridgeNotFound {
                    app_name: app_name.to_string(),
                })?;
            let mut connection = self
                .inner
                .storage
                .connection(app_name)
                .await?
                .ok_or_else(|| TonConnectError::ConnectionNotFound {
                    app_name: app_name.to_string(),
                })?;
            let wallet_key = connection.session.wallet_key.clone().ok_or_else(|| {
                TonConnectError::BadConnection {
                    error: "wallet key not set, handshake never completed".to_string(),
                }
            })?;

            request.id = connection.next_rpc_request_id.to_string();
            connection.next_rpc_request_id += 1;

            let (reply_tx, reply_rx) = oneshot::channel();
            self.inner
                .waiters
                .insert((app_name.to_string(), request.id.clone()), reply_tx);

            if let Err(e) = bridge.send(&request, &wallet_key, RPC_TTL_SECS).await {
                self.inner
                    .waiters
                    .remove(&(app_name.to_string(), request.id.clone()));
                return Err(e);
            }
            self.inner.storage.set_connection(app_name, connection).await?;
            (request.id, reply_rx)
        };

        debug!("request {request_id} sent to {app_name}, waiting for reply");
        match tokio::time::timeout(Duration::from_secs(RPC_TTL_SECS), reply_rx).await {
            Ok(Ok(reply)) => match reply.error {
                Some(error) => Err(TonConnectError::Wallet {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(reply),
            },
            Ok(Err(_)) => Err(TonConnectError::Rpc {
                response: "reply channel closed".to_string(),
            }),
            Err(_) => {
                self.inner
                    .waiters
                    .remove(&(app_name.to_string(), request_id.clone()));
                Err(TonConnectError::RpcTimeout { id: request_id })
            }
        }
    }

    /// Tell the wallet we are leaving (best effort), then drop the bridge and
    /// the stored connection.
    pub async fn disconnect(&self, app_name: &str) -> Result<()> {
        {
            let bridges = self.inner.bridges.lock().await;
            if let Some(bridge) = bridges.get(app_name) {
                if let Some(mut connection) = self.inner.storage.connection(app_name).await? {
                    if let Some(wallet_key) = connection.session.wallet_key.clone() {
                        let mut request = AppRequest::disconnect();
                        request.id = connection.next_rpc_request_id.to_string();
                        connection.next_rpc_request_id += 1;
                        if let Err(e) = bridge.send(&request, &wallet_key, RPC_TTL_SECS).await {
                            warn!("disconnect request to {app_name} failed: {e}");
                        }
                        self.inner.storage.set_connection(app_name, connection).await?;
                    }
                }
            }
        }
        self.inner.drop_bridge(app_name).await;
        self.inner.storage.remove_connection(app_name).await
    }

    /// Stop the listener task and all bridge subscriptions. The connector
    /// cannot be reused afterwards; stored sessions survive for
    /// [`TonConnect::restore_connection`] by a fresh instance.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.listener.lock().await.take() {
            task.abort();
        }
        for (_, bridge) in self.inner.bridges.lock().await.drain() {
            bridge.disconnect();
        }
        self.inner.waiters.clear();
    }

    async fn ensure_listener(&self) {
        let mut guard = self.inner.listener.lock().await;
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if let Some(queue_rx) = self.inner.queue_rx.lock().await.take() {
            let inner = self.inner.clone();
            *guard = Some(tokio::spawn(listener_loop(inner, queue_rx)));
        }
    }
}

async fn listener_loop(
    inner: Arc<ConnectorInner>,
    mut queue: mpsc::UnboundedReceiver<BridgeMessage>,
) {
    debug!("wallet event listener started");
    while let Some(message) = queue.recv().await {
        if let Err(e) = inner.handle_message(message).await {
            // One bad message must not take the listener down.
            error!("error processing bridge message: {e}");
        }
    }
    debug!("wallet event listener stopped");
}

impl ConnectorInner {
    async fn handle_message(&self, message: BridgeMessage) -> Result<()> {
        let app_name = message.app_name.clone();
        match message.event {
            BridgeEvent::Heartbeat => {
                debug!("heartbeat from {app_name}");
                self.storage.set_heartbeat(&app_name, unix_now()).await
            }
            BridgeEvent::Wallet(WalletMessage::Reply(reply)) => {
                match self.waiters.remove(&(app_name.clone(), reply.id.clone())) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(reply);
                    }
                    None => warn!("unexpected wallet reply {} from {app_name}", reply.id),
                }
                if let Some(event_id) = message.bridge_event_id {
                    if let Some(mut connection) = self.storage.connection(&app_name).await? {
                        connection.last_rpc_event_id = Some(event_id);
                        self.storage.set_connection(&app_name, connection).await?;
                    }
                }
                Ok(())
            }
            BridgeEvent::Wallet(WalletMessage::Event(event)) => {
                self.handle_wallet_event(app_name, message.source, event)
                    .await
            }
            BridgeEvent::Wallet(WalletMessage::Unknown(value)) => {
                warn!("unhandled wallet message from {app_name}: {value}");
                Ok(())
            }
        }
    }

    async fn handle_wallet_event(
        &self,
        app_name: String,
        source: Option<String>,
        event: WalletEvent,
    ) -> Result<()> {
        let Some(mut connection) = self.storage.connection(&app_name).await? else {
            error!("connection not found for {app_name}");
            return Ok(());
        };

        if connection
            .last_wallet_event_id
            .is_some_and(|last| event.id <= last)
        {
            debug!("skipping replayed wallet event {} from {app_name}", event.id);
            return Ok(());
        }
        connection.last_wallet_event_id = Some(event.id);

        match &event.body {
            WalletEventBody::Connect(payload) => {
                if payload.ton_addr().is_some() {
                    connection.session.wallet_key = source;
                    connection.connect_event = Some(event.clone());
                }
                self.storage.set_connection(&app_name, connection).await?;
                self.dispatch(event).await;
            }
            WalletEventBody::ConnectError(_) | WalletEventBody::Disconnect => {
                self.dispatch(event).await;
                self.drop_bridge(&app_name).await;
                self.storage.remove_connection(&app_name).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: WalletEvent) {
        let kind = event.body.kind();
        let future = match self.listeners.get(&kind) {
            Some(handler) => (handler.value())(event),
            None => {
                warn!("no handler registered for {} events", kind.as_str());
                return;
            }
        };
        future.await;
    }

    async fn drop_bridge(&self, app_name: &str) {
        if let Some(bridge) = self.bridges.lock().await.remove(app_name) {
            bridge.disconnect();
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{
        ConnectPayload, ConnectReplyItem, ErrorPayload, Network, TonAddressItem,
    };

    fn connector() -> (TonConnect, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let connector = TonConnect::new(
            "https://app.example/tonconnect-manifest.json",
            storage.clone(),
        );
        (connector, storage)
    }

    fn pending_connection(app_name: &str) -> Connection {
        Connection::new(
            Session {
                private_key: "aa".repeat(32),
                bridge_url: "https://bridge.tonapi.io/bridge".into(),
                wallet_key: None,
            },
            app_name.to_string(),
        )
    }

    fn connect_event(id: u64) -> WalletEvent {
        WalletEvent {
            id,
            body: WalletEventBody::Connect(ConnectPayload {
                items: vec![ConnectReplyItem::TonAddr(TonAddressItem {
                    address: "0:deadbeef".into(),
                    network: Network::Mainnet,
                    public_key: "bb".repeat(32),
                    wallet_state_init: "te6cc".into(),
                })],
                device: None,
            }),
        }
    }

    fn wallet_message(app_name: &str, source: &str, event: WalletEvent) -> BridgeMessage {
        BridgeMessage {
            app_name: app_name.into(),
            source: Some(source.into()),
            bridge_event_id: Some(event.id),
            event: BridgeEvent::Wallet(WalletMessage::Event(event)),
        }
    }

    #[tokio::test]
    async fn connect_event_completes_the_stored_connection() {
        let (connector, storage) = connector();
        storage
            .set_connection("tonkeeper", pending_connection("tonkeeper"))
            .await
            .unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        connector
            .listen(WalletEventKind::Connect, move |event: WalletEvent| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(event.id);
                }
            })
            .await
            .unwrap();

        let wallet_key = "cc".repeat(32);
        connector
            .inner
            .handle_message(wallet_message("tonkeeper", &wallet_key, connect_event(7)))
            .await
            .unwrap();

        let stored = storage.connection("tonkeeper").await.unwrap().unwrap();
        assert!(stored.is_connected());
        assert_eq!(stored.session.wallet_key.as_deref(), Some(wallet_key.as_str()));
        assert_eq!(stored.last_wallet_event_id, Some(7));
        assert_eq!(seen_rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn replayed_events_are_skipped() {
        let (connector, storage) = connector();
        let mut connection = pending_connection("tonkeeper");
        connection.last_wallet_event_id = Some(10);
        storage.set_connection("tonkeeper", connection).await.unwrap();

        connector
            .inner
            .handle_message(wallet_message("tonkeeper", &"cc".repeat(32), connect_event(9)))
            .await
            .unwrap();

        let stored = storage.connection("tonkeeper").await.unwrap().unwrap();
        assert!(!stored.is_connected());
        assert_eq!(stored.last_wallet_event_id, Some(10));
    }

    #[tokio::test]
    async fn disconnect_event_removes_the_connection() {
        let (connector, storage) = connector();
        storage
            .set_connection("tonkeeper", pending_connection("tonkeeper"))
            .await
            .unwrap();

        let event = WalletEvent {
            id: 3,
            body: WalletEventBody::Disconnect,
        };
        connector
            .inner
            .handle_message(wallet_message("tonkeeper", &"cc".repeat(32), event))
            .await
            .unwrap();

        assert!(storage.connection("tonkeeper").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replies_complete_their_waiters_and_advance_the_cursor() {
        let (connector, storage) = connector();
        storage
            .set_connection("tonkeeper", pending_connection("tonkeeper"))
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        connector
            .inner
            .waiters
            .insert(("tonkeeper".to_string(), "4".to_string()), reply_tx);

        let reply = RpcReply {
            id: "4".into(),
            result: Some(serde_json::json!("te6ccboc")),
            error: None,
        };
        connector
            .inner
            .handle_message(BridgeMessage {
                app_name: "tonkeeper".into(),
                source: Some("cc".repeat(32)),
                bridge_event_id: Some(123),
                event: BridgeEvent::Wallet(WalletMessage::Reply(reply)),
            })
            .await
            .unwrap();

        let received = reply_rx.await.unwrap();
        assert_eq!(received.result.unwrap(), "te6ccboc");
        assert!(connector.inner.waiters.is_empty());

        let stored = storage.connection("tonkeeper").await.unwrap().unwrap();
        assert_eq!(stored.last_rpc_event_id, Some(123));
    }

    #[tokio::test]
    async fn replies_only_complete_waiters_for_their_own_connection() {
        let (connector, _storage) = connector();

        // Two connected wallets, both waiting on their first request id.
        let (a_tx, mut a_rx) = oneshot::channel();
        let (b_tx, b_rx) = oneshot::channel();
        connector
            .inner
            .waiters
            .insert(("wallet-a".to_string(), "0".to_string()), a_tx);
        connector
            .inner
            .waiters
            .insert(("wallet-b".to_string(), "0".to_string()), b_tx);

        let reply = RpcReply {
            id: "0".into(),
            result: Some(serde_json::json!("signed-by-b")),
            error: None,
        };
        connector
            .inner
            .handle_message(BridgeMessage {
                app_name: "wallet-b".into(),
                source: None,
                bridge_event_id: None,
                event: BridgeEvent::Wallet(WalletMessage::Reply(reply)),
            })
            .await
            .unwrap();

        assert_eq!(b_rx.await.unwrap().result.unwrap(), "signed-by-b");
        // Wallet A's call is still pending, not dropped and not answered.
        assert!(a_rx.try_recv().is_err());
        assert!(connector
            .inner
            .waiters
            .contains_key(&("wallet-a".to_string(), "0".to_string())));
    }

    #[tokio::test]
    async fn unexpected_replies_are_dropped() {
        let (connector, _storage) = connector();
        let reply = RpcReply {
            id: "999".into(),
            result: None,
            error: Some(ErrorPayload {
                code: 300,
                message: "user declined".into(),
            }),
        };
        // No waiter registered and no connection stored; must not error.
        connector
            .inner
            .handle_message(BridgeMessage {
                app_name: "tonkeeper".into(),
                source: None,
                bridge_event_id: None,
                event: BridgeEvent::Wallet(WalletMessage::Reply(reply)),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeats_land_in_storage() {
        let (connector, storage) = connector();
        connector
            .inner
            .handle_message(BridgeMessage {
                app_name: "tonkeeper".into(),
                source: None,
                bridge_event_id: None,
                event: BridgeEvent::Heartbeat,
            })
            .await
            .unwrap();

        let entry = storage.entry("tonkeeper").await.unwrap().unwrap();
        assert!(entry.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn send_without_a_bridge_is_an_error() {
        let (connector, _storage) = connector();
        let result = connector
            .send("tonkeeper", AppRequest::disconnect())
            .await;
        assert!(matches!(
            result,
            Err(TonConnectError::BridgeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn one_handler_per_event_kind() {
        let (connector, _storage) = connector();
        connector
            .listen(WalletEventKind::Disconnect, |_| async {})
            .await
            .unwrap();
        let again = connector
            .listen(WalletEventKind::Disconnect, |_| async {})
            .await;
        assert!(matches!(again, Err(TonConnectError::ListenerExists(_))));
    }
}
