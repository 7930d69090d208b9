//! BLAKE3-based hashing: deterministic session ids and session-id hints.

/// Derive a session id deterministically from the agreement inputs. Treated
/// as opaque by every consumer.
pub fn session_id(members: &[String], ladder_cardinal: &[u8; 32]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"mpenc-session-id-v1\x00");
    for m in members {
        hasher.update(m.as_bytes());
        hasher.update(b"\x00");
    }
    hasher.update(ladder_cardinal);
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// A short, deliberately-ambiguous hint used to narrow trial decryption
/// candidates. Collisions are expected and always resolved by trial.
pub fn session_hint(session_id: &str) -> u8 {
    blake3::hash(session_id.as_bytes()).as_bytes()[0]
}

/// A hint derived from a group key, used the same way as `session_hint`
/// when multiple keys exist for one session.
pub fn key_hint(key: &[u8; 32]) -> u8 {
    blake3::hash(key).as_bytes()[0]
}
