pub mod request;
pub mod wallet;

pub use request::{
    AppMethod, AppRequest, ConnectItem, ConnectRequest, SendTransactionPayload, SignDataPayload,
    TransactionMessage,
};
pub use wallet::{
    ConnectPayload, ConnectReplyItem, DeviceInfo, ErrorPayload, ProofDomain, RpcReply,
    TonAddressItem, TonProof, TonProofItem, WalletEvent, WalletEventBody, WalletEventKind,
    WalletMessage,
};

use serde::{Deserialize, Serialize};

/// TON network a wallet account lives on, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "-239")]
    Mainnet,
    #[serde(rename = "-3")]
    Testnet,
}
