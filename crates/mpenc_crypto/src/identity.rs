//! Identity and ephemeral signing keys.
//!
//! Each *member* has one long-term `LongTermKeyPair` (Ed25519), published
//! through the directory and never rotated by this crate. Each *session*
//! gets a per-member `EphemeralKeyPair`, rotated on refresh/full-refresh and
//! bound to the session by a session-acknowledgement signature. The
//! ephemeral private key is deliberately revealed at quit time so peers can
//! retroactively verify the speaker's past traffic — see [`quit_reveal`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Human-readable fingerprint for out-of-band verification: BLAKE3 of
    /// the key, truncated to 20 bytes, hex-encoded in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Constant-time comparison of two keys' fingerprints.
    pub fn fingerprints_match(&self, other: &PublicKeyBytes) -> bool {
        use subtle::ConstantTimeEq;
        let h1 = blake3::hash(&self.0);
        let h2 = blake3::hash(&other.0);
        h1.as_bytes().ct_eq(h2.as_bytes()).into()
    }
}

fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key not 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn signature_from_bytes(bytes: &[u8]) -> Result<Signature, CryptoError> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("signature not 64 bytes".into()))?;
    Ok(Signature::from_bytes(&arr))
}

/// Long-term per-member signing key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct LongTermKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl LongTermKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec()),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = verifying_key(public_bytes)?;
        let sig = signature_from_bytes(sig_bytes)?;
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }
}

/// Per-session, per-member signing key, generated fresh on first
/// contribution to a key-agreement round. Rotated on refresh/full-refresh;
/// revealed at quit.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec()),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes().to_vec()
    }

    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        LongTermKeyPair::verify(public_bytes, msg, sig_bytes)
    }

    /// Export the raw secret bytes for a quit announcement. Once revealed,
    /// peers can use [`verify`] against archived traffic signed by this key.
    pub fn quit_reveal(&self) -> [u8; 32] {
        self.secret_bytes
    }

    /// Reconstruct an ephemeral public key from a revealed quit secret, so a
    /// receiver can confirm the revealed key matches the one on file.
    pub fn public_from_revealed(secret_bytes: &[u8; 32]) -> PublicKeyBytes {
        let signing_key = SigningKey::from_bytes(secret_bytes);
        PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec())
    }
}
