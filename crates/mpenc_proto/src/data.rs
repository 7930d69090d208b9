//! Data envelope — encrypted user messages.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 1;

/// On-wire encrypted data message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Truncation of the session id or group key, advisory only — never
    /// assumed unique, and never trusted as a lookup key by itself.
    pub session_hint: u8,
    pub version: u8,
    pub source: String,
    pub dest: String,
    /// Signature over the ciphertext, made with the sender's ephemeral key.
    pub signature: Vec<u8>,
    /// 24-byte XChaCha20-Poly1305 nonce, prepended to the ciphertext by
    /// `mpenc_crypto::aead`, kept separate here for clarity on the wire.
    pub iv: [u8; 24],
    pub ciphertext: Vec<u8>,
}

/// The plaintext TLV body carried inside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBody {
    pub parents: Vec<String>,
    pub padding: u32,
    pub body: Vec<u8>,
}
