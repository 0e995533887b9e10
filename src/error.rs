use crate::types::WalletEventKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TonConnectError>;

#[derive(Error, Debug)]
pub enum TonConnectError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("crypto error: {error}")]
    Crypto { error: String },
    #[error("storage error: {error}")]
    Storage { error: String },
    #[error("storage entry already exists for {app_name}")]
    DuplicateEntry { app_name: String },
    #[error("connection already exists, use restore_connection")]
    ConnectionExists,
    #[error("no stored connection for wallet app {app_name}")]
    ConnectionNotFound { app_name: String },
    #[error("stored connection is incomplete: {error}")]
    BadConnection { error: String },
    #[error("no active bridge for wallet app {app_name}")]
    BridgeNotFound { app_name: String },
    #[error("wallet app {app_name} has no SSE bridge")]
    UnsupportedWallet { app_name: String },
    #[error("bridge subscription failed: {error}")]
    Subscribe { error: String },
    #[error("bridge rejected message: {response}")]
    Rpc { response: String },
    #[error("wallet returned error {code}: {message}")]
    Wallet { code: i64, message: String },
    #[error("timed out waiting for wallet reply to request {id}")]
    RpcTimeout { id: String },
    #[error("a handler is already registered for {0:?} events")]
    ListenerExists(WalletEventKind),
}

impl TonConnectError {
    pub(crate) fn crypto(error: impl ToString) -> Self {
        TonConnectError::Crypto {
            error: error.to_string(),
        }
    }

    pub(crate) fn storage(error: impl ToString) -> Self {
        TonConnectError::Storage {
            error: error.to_string(),
        }
    }
}
