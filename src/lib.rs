//! App-side client for the TON Connect protocol.
//!
//! TON Connect lets an application ask a TON wallet for authentication and
//! transaction signing. App and wallet never talk directly: both sides POST
//! NaCl-sealed messages to an HTTP bridge and receive them over Server-Sent
//! Events. This crate implements the app side of that exchange: key
//! management, the bridge subscription, session persistence, and the
//! request/reply bookkeeping on top.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ton_connect::{MemoryStorage, TonConnect, WalletEventKind, WalletFilter};
//!
//! # async fn run() -> ton_connect::Result<()> {
//! let connector = TonConnect::new(
//!     "https://app.example/tonconnect-manifest.json",
//!     Arc::new(MemoryStorage::new()),
//! );
//!
//! connector
//!     .listen(WalletEventKind::Connect, |event| async move {
//!         println!("wallet connected: {event:?}");
//!     })
//!     .await?;
//!
//! let wallets = connector.get_wallets(&WalletFilter::default()).await?;
//! let url = connector.connect(&wallets[0], None).await?;
//! println!("open in wallet: {url}");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod connector;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod types;
pub mod wallets;

pub use bridge::{Bridge, BridgeEvent, BridgeMessage, DEFAULT_UNIVERSAL_URL};
pub use connector::{EventHandler, TonConnect};
pub use crypto::SessionCrypto;
pub use error::{Result, TonConnectError};
pub use storage::{Connection, FileStorage, MemoryStorage, Session, Storage, StorageEntry};
pub use types::{
    AppMethod, AppRequest, ConnectItem, ConnectPayload, ConnectReplyItem, ConnectRequest,
    DeviceInfo, ErrorPayload, Network, ProofDomain, RpcReply, SendTransactionPayload,
    SignDataPayload, TonAddressItem, TonProof, TonProofItem, TransactionMessage, WalletEvent,
    WalletEventBody, WalletEventKind, WalletMessage,
};
pub use wallets::{BridgeEntry, WalletApp, WalletFilter, WalletsList, WALLETS_LIST_URL};
