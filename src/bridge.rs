use crate::crypto::SessionCrypto;
use crate::error::{Result, TonConnectError};
use crate::types::{AppRequest, ConnectRequest, WalletMessage};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, error, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::form_urlencoded;

/// Fallback universal link prefix when a wallet doesn't publish one.
pub const DEFAULT_UNIVERSAL_URL: &str = "tc://";

/// How long we give the first SSE subscription to come up.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Sentinel for "no event seen yet" in the resume cursor.
const NO_EVENT_ID: u64 = u64::MAX;

/// A decrypted message delivered from the bridge to the connector queue.
#[derive(Debug, Clone)]
pub struct BridgeMessage {
    pub app_name: String,
    /// Sender's public key (hex). Absent for heartbeats.
    pub source: Option<String>,
    /// SSE event id, the bridge-side resume cursor.
    pub bridge_event_id: Option<u64>,
    pub event: BridgeEvent,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Heartbeat,
    Wallet(WalletMessage),
}

#[derive(Deserialize)]
struct SealedEnvelope {
    from: String,
    message: String,
}

/// One SSE subscription to a wallet bridge, end-to-end encrypted with the
/// session keypair. Decrypted messages land on the connector's shared queue.
pub struct Bridge {
    inner: Arc<BridgeInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct BridgeInner {
    app_name: String,
    bridge_url: String,
    universal_url: String,
    crypto: SessionCrypto,
    client: reqwest::Client,
    queue: mpsc::UnboundedSender<BridgeMessage>,
    /// Closed until the connector has persisted the new session; events that
    /// arrive earlier wait here instead of racing the storage write.
    gate_tx: watch::Sender<bool>,
    connected_tx: watch::Sender<bool>,
    last_event_id: AtomicU64,
}

impl Bridge {
    pub fn new(
        app_name: String,
        client: reqwest::Client,
        queue: mpsc::UnboundedSender<BridgeMessage>,
        bridge_url: String,
        universal_url: Option<String>,
        crypto: SessionCrypto,
        last_event_id: Option<u64>,
    ) -> Self {
        let (gate_tx, _) = watch::channel(false);
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BridgeInner {
                app_name,
                bridge_url,
                universal_url: universal_url.unwrap_or_else(|| DEFAULT_UNIVERSAL_URL.to_string()),
                crypto,
                client,
                queue,
                gate_tx,
                connected_tx,
                last_event_id: AtomicU64::new(last_event_id.unwrap_or(NO_EVENT_ID)),
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn bridge_url(&self) -> &str {
        &self.inner.bridge_url
    }

    /// Hex public key, our address on the bridge.
    pub fn client_id(&self) -> String {
        self.inner.crypto.public_key_hex()
    }

    pub fn session_private_key_hex(&self) -> String {
        self.inner.crypto.private_key_hex()
    }

    /// Spawn the event loop and wait until the SSE stream is up once.
    pub async fn subscribe(&self) -> Result<()> {
        let mut connected = self.inner.connected_tx.subscribe();
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_event_loop(inner));
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }

        let wait = tokio::time::timeout(SUBSCRIBE_TIMEOUT, connected.wait_for(|up| *up)).await;
        match wait {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => {
                self.disconnect();
                Err(TonConnectError::Subscribe {
                    error: "bridge event loop exited".to_string(),
                })
            }
            Err(_) => {
                self.disconnect();
                Err(TonConnectError::Subscribe {
                    error: format!(
                        "no SSE connection to {} within {}s",
                        self.inner.bridge_url,
                        SUBSCRIBE_TIMEOUT.as_secs()
                    ),
                })
            }
        }
    }

    /// Let queued events through; called once the connector has persisted the
    /// session this bridge belongs to.
    pub fn open_gate(&self) {
        let _ = self.inner.gate_tx.send(true);
    }

    pub fn is_alive(&self) -> bool {
        self.listener
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    pub fn disconnect(&self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        let _ = self.inner.connected_tx.send(false);
    }

    /// Universal connect URL the user opens (or scans) in the wallet.
    pub fn connect_url(&self, request: &ConnectRequest) -> Result<String> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("v", "2")
            .append_pair("id", &self.inner.crypto.public_key_hex())
            .append_pair("r", &serde_json::to_string(request)?)
            .append_pair("ret", "back")
            .finish();
        let universal = &self.inner.universal_url;
        let separator = if universal.contains('?') { '&' } else { '?' };
        Ok(format!("{universal}{separator}{query}"))
    }

    /// Seal an RPC request for the wallet and publish it on the bridge.
    pub async fn send(&self, request: &AppRequest, wallet_key: &str, ttl: u64) -> Result<()> {
        let plaintext = serde_json::to_vec(request)?;
        let sealed = self.inner.crypto.encrypt(&plaintext, wallet_key)?;

        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.inner.crypto.public_key_hex())
            .append_pair("to", wallet_key)
            .append_pair("ttl", &ttl.to_string())
            .append_pair("topic", request.method.as_str())
            .finish();
        let url = format!(
            "{}/message?{}",
            self.inner.bridge_url.trim_end_matches('/'),
            query
        );

        let ack: serde_json::Value = self
            .inner
            .client
            .post(url)
            .body(sealed)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if ack.get("statusCode").and_then(serde_json::Value::as_u64) != Some(200) {
            return Err(TonConnectError::Rpc {
                response: ack.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl BridgeInner {
    fn events_url(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("client_id", &self.crypto.public_key_hex());
        let last_event_id = self.last_event_id.load(Ordering::Relaxed);
        if last_event_id != NO_EVENT_ID {
            query.append_pair("last_event_id", &last_event_id.to_string());
        }
        format!(
            "{}/events?{}",
            self.bridge_url.trim_end_matches('/'),
            query.finish()
        )
    }

    async fn handle_event(&self, event: eventsource_stream::Event) -> Result<()> {
        // Hold events until the connector is ready for them.
        let mut gate = self.gate_tx.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let bridge_event_id = event.id.parse::<u64>().ok();
        if let Some(id) = bridge_event_id {
            self.last_event_id.store(id, Ordering::Relaxed);
        }

        if event.data == "heartbeat" {
            return self.deliver(BridgeMessage {
                app_name: self.app_name.clone(),
                source: None,
                bridge_event_id,
                event: BridgeEvent::Heartbeat,
            });
        }

        let envelope: SealedEnvelope = serde_json::from_str(&event.data)?;
        let plaintext = self.crypto.decrypt(&envelope.message, &envelope.from)?;
        let message: WalletMessage = serde_json::from_slice(&plaintext)?;
        self.deliver(BridgeMessage {
            app_name: self.app_name.clone(),
            source: Some(envelope.from),
            bridge_event_id,
            event: BridgeEvent::Wallet(message),
        })
    }

    fn deliver(&self, message: BridgeMessage) -> Result<()> {
        if self.queue.send(message).is_err() {
            warn!("bridge {}: connector queue is gone", self.app_name);
        }
        Ok(())
    }
}

async fn run_event_loop(inner: Arc<BridgeInner>) {
    let mut failures: u32 = 0;
    loop {
        match stream_events(&inner).await {
            Ok(()) => {
                failures = 0;
                debug!(
                    "bridge {}: stream closed by server, reconnecting",
                    inner.app_name
                );
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!("bridge {}: stream failed: {e}", inner.app_name);
            }
        }
        let _ = inner.connected_tx.send(false);
        tokio::time::sleep(reconnect_delay(failures)).await;
    }
}

/// Capped exponential backoff, starting at one second.
fn reconnect_delay(failures: u32) -> Duration {
    let exp = failures.min(6);
    Duration::from_secs((1u64 << exp).min(MAX_RECONNECT_DELAY_SECS))
}

async fn stream_events(inner: &BridgeInner) -> Result<()> {
    let url = inner.events_url();
    debug!("bridge {}: subscribing to {url}", inner.app_name);

    let response = inner
        .client
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;
    let _ = inner.connected_tx.send(true);

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| TonConnectError::Subscribe {
            error: e.to_string(),
        })?;
        if let Err(e) = inner.handle_event(event).await {
            // One malformed or undecryptable event must not drop the stream.
            error!("bridge {}: dropping bad event: {e}", inner.app_name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectItem, WalletEventBody};

    fn test_bridge(universal_url: Option<String>) -> (Bridge, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(
            "tonkeeper".into(),
            reqwest::Client::new(),
            tx,
            "https://bridge.tonapi.io/bridge".into(),
            universal_url,
            SessionCrypto::generate(),
            None,
        );
        (bridge, rx)
    }

    fn sse_event(id: &str, data: &str) -> eventsource_stream::Event {
        eventsource_stream::Event {
            id: id.to_string(),
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn connect_url_carries_the_request() {
        let (bridge, _rx) = test_bridge(Some("https://app.tonkeeper.com/ton-connect".into()));
        let request = ConnectRequest {
            manifest_url: "https://app.example/manifest.json".into(),
            items: vec![ConnectItem::TonAddr],
        };
        let url = bridge.connect_url(&request).unwrap();
        assert!(url.starts_with("https://app.tonkeeper.com/ton-connect?v=2&id="));
        assert!(url.contains(&bridge.client_id()));
        assert!(url.contains("ton_addr"));
        assert!(url.ends_with("&ret=back"));
    }

    #[test]
    fn connect_url_appends_to_an_existing_query() {
        let (bridge, _rx) = test_bridge(Some("https://t.me/wallet?attach=wallet".into()));
        let request = ConnectRequest {
            manifest_url: "https://app.example/manifest.json".into(),
            items: vec![ConnectItem::TonAddr],
        };
        let url = bridge.connect_url(&request).unwrap();
        assert!(url.starts_with("https://t.me/wallet?attach=wallet&v=2&"));
    }

    #[test]
    fn events_url_includes_resume_cursor() {
        let (bridge, _rx) = test_bridge(None);
        let without = bridge.inner.events_url();
        assert!(without.contains("/bridge/events?client_id="));
        assert!(!without.contains("last_event_id"));

        bridge.inner.last_event_id.store(17, Ordering::Relaxed);
        let with = bridge.inner.events_url();
        assert!(with.ends_with("&last_event_id=17"));
    }

    #[tokio::test]
    async fn sealed_events_are_decrypted_and_queued() {
        let (bridge, mut rx) = test_bridge(None);
        bridge.open_gate();

        let wallet = SessionCrypto::generate();
        let plaintext = br#"{"event":"disconnect","id":5,"payload":{}}"#;
        let sealed = wallet.encrypt(plaintext, &bridge.client_id()).unwrap();
        let data = serde_json::json!({
            "from": wallet.public_key_hex(),
            "message": sealed,
        })
        .to_string();

        bridge.inner.handle_event(sse_event("99", &data)).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.app_name, "tonkeeper");
        assert_eq!(message.source.as_deref(), Some(wallet.public_key_hex().as_str()));
        assert_eq!(message.bridge_event_id, Some(99));
        let BridgeEvent::Wallet(WalletMessage::Event(event)) = message.event else {
            panic!("expected wallet event");
        };
        assert!(matches!(event.body, WalletEventBody::Disconnect));
        assert_eq!(bridge.inner.last_event_id.load(Ordering::Relaxed), 99);
    }

    #[tokio::test]
    async fn events_are_held_until_the_gate_opens() {
        let (bridge, mut rx) = test_bridge(None);

        let inner = bridge.inner.clone();
        let held = tokio::spawn(async move { inner.handle_event(sse_event("8", "heartbeat")).await });

        // The connector hasn't persisted the session yet; nothing may land
        // on the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        bridge.open_gate();
        held.await.unwrap().unwrap();
        let message = rx.recv().await.unwrap();
        assert!(matches!(message.event, BridgeEvent::Heartbeat));
        assert_eq!(message.bridge_event_id, Some(8));
    }

    #[tokio::test]
    async fn heartbeats_pass_through_unparsed() {
        let (bridge, mut rx) = test_bridge(None);
        bridge.open_gate();

        bridge
            .inner
            .handle_event(sse_event("", "heartbeat"))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert!(message.source.is_none());
        assert!(matches!(message.event, BridgeEvent::Heartbeat));
    }

    #[tokio::test]
    async fn undecryptable_event_is_an_error_not_a_panic() {
        let (bridge, _rx) = test_bridge(None);
        bridge.open_gate();

        let data = serde_json::json!({
            "from": SessionCrypto::generate().public_key_hex(),
            "message": "bm90IGEgc2VhbGVkIGJveA==",
        })
        .to_string();
        assert!(bridge.inner.handle_event(sse_event("1", &data)).await.is_err());
    }

    #[test]
    fn reconnect_backoff_is_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(60), Duration::from_secs(60));
    }
}
