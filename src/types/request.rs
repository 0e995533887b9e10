use crate::error::Result;
use crate::types::Network;
use serde::{Deserialize, Serialize};

/// Initial request the app encodes into the connect URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub manifest_url: String,
    pub items: Vec<ConnectItem>,
}

/// Items the app asks the wallet to reply with on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ConnectItem {
    /// The wallet's account address and state init.
    TonAddr,
    /// A signed ownership proof over the given payload.
    TonProof { payload: String },
}

/// RPC methods an app may call on a connected wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppMethod {
    SendTransaction,
    SignData,
    Disconnect,
}

impl AppMethod {
    /// Wire name, also used as the bridge `topic` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMethod::SendTransaction => "sendTransaction",
            AppMethod::SignData => "signData",
            AppMethod::Disconnect => "disconnect",
        }
    }
}

/// RPC envelope sent to the wallet. `params` carries the payload as a
/// JSON-encoded string, per protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRequest {
    pub method: AppMethod,
    pub params: Vec<String>,
    /// Assigned by the connector right before sending.
    #[serde(default)]
    pub id: String,
}

impl AppRequest {
    pub fn send_transaction(payload: &SendTransactionPayload) -> Result<Self> {
        Ok(Self {
            method: AppMethod::SendTransaction,
            params: vec![serde_json::to_string(payload)?],
            id: String::new(),
        })
    }

    pub fn sign_data(payload: &SignDataPayload) -> Result<Self> {
        Ok(Self {
            method: AppMethod::SignData,
            params: vec![serde_json::to_string(payload)?],
            id: String::new(),
        })
    }

    pub fn disconnect() -> Self {
        Self {
            method: AppMethod::Disconnect,
            params: Vec::new(),
            id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionPayload {
    /// Unix timestamp after which the wallet must reject the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    /// Sender address the app expects the wallet to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub messages: Vec<TransactionMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub address: String,
    /// Amount in nanotons, as a decimal string.
    pub amount: String,
    /// base64 BoC with the message body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// base64 BoC with the contract state init.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignDataPayload {
    Text { text: String },
    Binary { bytes: String },
    Cell { schema: String, cell: String },
}
