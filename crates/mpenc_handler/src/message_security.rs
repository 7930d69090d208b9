//! Per-session data message encrypt/decrypt.

use mpenc_crypto::aead;
use mpenc_crypto::identity::EphemeralKeyPair;
use mpenc_proto::codec;
use mpenc_proto::data::{DataBody, DataEnvelope, PROTOCOL_VERSION};

use crate::error::HandlerError;
use crate::keystore::Session;

/// Bytes signed by the sender's ephemeral key: the IV and ciphertext, so a
/// receiver can authenticate authorship independently of the AEAD tag
/// (which only proves knowledge of the group key, not identity).
fn signing_bytes(iv: &[u8; 24], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    out
}

pub fn encrypt(
    plaintext: &[u8],
    session: &Session,
    own_ephemeral: &EphemeralKeyPair,
    source: &str,
    dest: &str,
    parents: Vec<String>,
    padding_size: u32,
) -> Result<DataEnvelope, HandlerError> {
    let key = session
        .current_key()
        .ok_or_else(|| HandlerError::Precondition(format!("session {} has no group key", session.id)))?;

    let body = DataBody { parents, padding: padding_size, body: plaintext.to_vec() };
    let body_bytes = serde_json::to_vec(&body).map_err(mpenc_crypto::CryptoError::from)?;
    let padded = codec::pad(&body_bytes, padding_size);

    let wire = aead::encrypt(key, &padded, dest.as_bytes())?;
    let (iv_bytes, ciphertext) = wire.split_at(24);
    let mut iv = [0u8; 24];
    iv.copy_from_slice(iv_bytes);
    let ciphertext = ciphertext.to_vec();

    let signature = own_ephemeral.sign(&signing_bytes(&iv, &ciphertext));

    Ok(DataEnvelope {
        session_hint: mpenc_crypto::hash::session_hint(&session.id),
        version: PROTOCOL_VERSION,
        source: source.to_string(),
        dest: dest.to_string(),
        signature,
        iv,
        ciphertext,
    })
}

/// Decrypted payload plus the message ancestry it declared.
pub struct Decrypted {
    pub body: Vec<u8>,
    pub parents: Vec<String>,
}

/// Try every candidate session's current and historical keys in turn; the
/// sender's session hint is advisory only and never trusted as a direct
/// lookup, since hints can collide across concurrently-known sessions.
/// Returns `None` if no candidate verifies — the caller stashes the
/// ciphertext in the TrialBuffer.
pub fn decrypt(packet: &DataEnvelope, claimed_author: &str, candidates: &[&Session]) -> Option<Decrypted> {
    let signed = signing_bytes(&packet.iv, &packet.ciphertext);
    let mut wire = Vec::with_capacity(24 + packet.ciphertext.len());
    wire.extend_from_slice(&packet.iv);
    wire.extend_from_slice(&packet.ciphertext);

    for session in candidates {
        let Some(idx) = session.members.iter().position(|m| m == claimed_author) else {
            continue;
        };
        let author_pub = &session.ephemeral_pub_keys[idx];
        if EphemeralKeyPair::verify(author_pub, &signed, &packet.signature).is_err() {
            continue;
        }
        for key in &session.group_keys {
            let Ok(plaintext) = aead::decrypt(key, &wire, packet.dest.as_bytes()) else {
                continue;
            };
            let Ok(unpadded) = codec::unpad(&plaintext) else {
                continue;
            };
            if let Ok(body) = serde_json::from_slice::<DataBody>(&unpadded) {
                return Some(Decrypted { body: body.body, parents: body.parents });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpenc_crypto::identity::EphemeralKeyPair;

    fn session_with(id: &str, member: &str, pub_key: Vec<u8>, key: [u8; 32]) -> Session {
        Session { id: id.into(), members: vec![member.into()], ephemeral_pub_keys: vec![pub_key], group_keys: vec![key] }
    }

    #[test]
    fn roundtrip_for_group_member() {
        let eph = EphemeralKeyPair::generate();
        let session = session_with("s0", "alice", eph.public.0.clone(), [9u8; 32]);

        let packet = encrypt(b"hello", &session, &eph, "alice", "", vec![], 0).unwrap();
        let result = decrypt(&packet, "alice", &[&session]).unwrap();
        assert_eq!(result.body, b"hello");
    }

    #[test]
    fn non_member_cannot_decrypt() {
        let eph = EphemeralKeyPair::generate();
        let session = session_with("s0", "alice", eph.public.0.clone(), [9u8; 32]);
        let packet = encrypt(b"hello", &session, &eph, "alice", "", vec![], 0).unwrap();

        let other_session = session_with("s1", "mallory", EphemeralKeyPair::generate().public.0, [1u8; 32]);
        assert!(decrypt(&packet, "alice", &[&other_session]).is_none());
    }

    #[test]
    fn historical_key_still_decrypts() {
        let eph = EphemeralKeyPair::generate();
        let mut session = session_with("s0", "alice", eph.public.0.clone(), [9u8; 32]);
        let packet = encrypt(b"hello", &session, &eph, "alice", "", vec![], 0).unwrap();

        // a refresh prepends a new key; the old ciphertext must still verify
        // against the historical one.
        session.group_keys.insert(0, [2u8; 32]);
        let result = decrypt(&packet, "alice", &[&session]).unwrap();
        assert_eq!(result.body, b"hello");
    }
}
