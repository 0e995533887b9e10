use crate::error::{Result, TonConnectError};
use base64::{engine::general_purpose::STANDARD as base64_standard, Engine};
use crypto_box::{
    aead::{generic_array::GenericArray, Aead, AeadCore, OsRng},
    PublicKey, SalsaBox, SecretKey,
};

/// NaCl `crypto_box` nonce length. The nonce is prepended to the ciphertext
/// before the payload is base64-encoded for the bridge.
const NONCE_LEN: usize = 24;

/// Per-session NaCl keypair. The hex-encoded public key doubles as the
/// `client_id` under which the bridge delivers events to us.
pub struct SessionCrypto {
    secret: SecretKey,
    public: PublicKey,
}

impl SessionCrypto {
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Restore a session keypair from a stored hex private key.
    pub fn from_private_hex(private_key: &str) -> Result<Self> {
        let secret = SecretKey::from(parse_key(private_key)?);
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Seal `plaintext` for `receiver_public_key` (hex). Returns
    /// `base64(nonce || box)`, the wire format bridges relay verbatim.
    pub fn encrypt(&self, plaintext: &[u8], receiver_public_key: &str) -> Result<String> {
        let receiver = PublicKey::from(parse_key(receiver_public_key)?);
        let sealer = SalsaBox::new(&receiver, &self.secret);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = sealer
            .encrypt(&nonce, plaintext)
            .map_err(|_| TonConnectError::crypto("encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(base64_standard.encode(payload))
    }

    /// Open a `base64(nonce || box)` payload sealed by `sender_public_key` (hex).
    pub fn decrypt(&self, payload: &str, sender_public_key: &str) -> Result<Vec<u8>> {
        let payload = base64_standard
            .decode(payload)
            .map_err(TonConnectError::crypto)?;
        if payload.len() <= NONCE_LEN {
            return Err(TonConnectError::crypto("sealed payload too short"));
        }

        let sender = PublicKey::from(parse_key(sender_public_key)?);
        let opener = SalsaBox::new(&sender, &self.secret);
        let nonce = GenericArray::from_slice(&payload[..NONCE_LEN]);
        opener
            .decrypt(nonce, &payload[NONCE_LEN..])
            .map_err(|_| TonConnectError::crypto("decryption failed, bad key or tampered payload"))
    }
}

fn parse_key(key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(key).map_err(TonConnectError::crypto)?;
    bytes
        .try_into()
        .map_err(|_| TonConnectError::crypto("key must be 32 bytes of hex"))
}
