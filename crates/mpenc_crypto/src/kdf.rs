//! Key derivation: turning a completed GDH cardinal into a group key, and
//! authenticating session acknowledgements.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::gdh::LadderPoint;

/// Derive the 32-byte symmetric group key from a completed ladder cardinal.
pub fn derive_group_key(cardinal: &LadderPoint, session_id: &str) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), cardinal);
    let mut key = [0u8; 32];
    hk.expand(b"mpenc-group-key-v1", &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Expand arbitrary input key material into `output.len()` bytes.
pub fn hkdf_expand(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
