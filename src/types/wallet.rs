use crate::types::Network;
use serde::{Deserialize, Serialize};

/// Anything the wallet side can push at us through the bridge, after
/// decryption. Unknown shapes parse as `Unknown` instead of failing, so one
/// new wallet feature cannot kill the whole event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WalletMessage {
    Event(WalletEvent),
    Reply(RpcReply),
    Unknown(serde_json::Value),
}

/// Spontaneous wallet event: `{ "event": <name>, "id": <u64>, "payload": .. }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawWalletEvent", into = "RawWalletEvent")]
pub struct WalletEvent {
    /// Wallet-side monotonic event id, used to drop replays.
    pub id: u64,
    pub body: WalletEventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalletEventBody {
    Connect(ConnectPayload),
    ConnectError(ErrorPayload),
    Disconnect,
}

impl WalletEventBody {
    pub fn kind(&self) -> WalletEventKind {
        match self {
            WalletEventBody::Connect(_) => WalletEventKind::Connect,
            WalletEventBody::ConnectError(_) => WalletEventKind::ConnectError,
            WalletEventBody::Disconnect => WalletEventKind::Disconnect,
        }
    }
}

/// Event discriminant, used as the key when registering handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletEventKind {
    Connect,
    ConnectError,
    Disconnect,
}

impl WalletEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletEventKind::Connect => "connect",
            WalletEventKind::ConnectError => "connect_error",
            WalletEventKind::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawWalletEvent {
    event: String,
    id: u64,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<RawWalletEvent> for WalletEvent {
    type Error = serde_json::Error;

    fn try_from(raw: RawWalletEvent) -> Result<Self, Self::Error> {
        let body = match raw.event.as_str() {
            "connect" => WalletEventBody::Connect(serde_json::from_value(raw.payload)?),
            "connect_error" => WalletEventBody::ConnectError(serde_json::from_value(raw.payload)?),
            "disconnect" => WalletEventBody::Disconnect,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown wallet event {other}"
                )))
            }
        };
        Ok(WalletEvent { id: raw.id, body })
    }
}

impl From<WalletEvent> for RawWalletEvent {
    fn from(event: WalletEvent) -> Self {
        let payload = match &event.body {
            WalletEventBody::Connect(payload) => {
                serde_json::to_value(payload).unwrap_or_default()
            }
            WalletEventBody::ConnectError(payload) => {
                serde_json::to_value(payload).unwrap_or_default()
            }
            WalletEventBody::Disconnect => serde_json::json!({}),
        };
        RawWalletEvent {
            event: event.body.kind().as_str().to_string(),
            id: event.id,
            payload,
        }
    }
}

/// Payload of a successful `connect` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub items: Vec<ConnectReplyItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

impl ConnectPayload {
    pub fn ton_addr(&self) -> Option<&TonAddressItem> {
        self.items.iter().find_map(|item| match item {
            ConnectReplyItem::TonAddr(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn ton_proof(&self) -> Option<&TonProofItem> {
        self.items.iter().find_map(|item| match item {
            ConnectReplyItem::TonProof(proof) => Some(proof),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ConnectReplyItem {
    TonAddr(TonAddressItem),
    TonProof(TonProofItem),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TonAddressItem {
    /// Raw address, `workchain:hex`.
    pub address: String,
    pub network: Network,
    pub public_key: String,
    /// base64 BoC with the wallet contract state init.
    pub wallet_state_init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TonProofItem {
    pub proof: TonProof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TonProof {
    pub timestamp: u64,
    pub domain: ProofDomain,
    pub signature: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofDomain {
    pub length_bytes: u32,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

/// Wallet client metadata reported in the `connect` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: String,
    pub app_name: String,
    pub app_version: String,
    pub max_protocol_version: u32,
    #[serde(default)]
    pub features: Vec<serde_json::Value>,
}

/// Reply to an `AppRequest`, matched to its originator by string `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}
