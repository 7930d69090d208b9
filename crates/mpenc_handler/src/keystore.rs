//! Ordered cache of sub-sessions, most-recent-first.

use tracing::warn;

use crate::error::HandlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Drop,
    WarnOnly,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub members: Vec<String>,
    /// Index-aligned with `members`.
    pub ephemeral_pub_keys: Vec<Vec<u8>>,
    /// Reverse chronological: most recent group key first.
    pub group_keys: Vec<[u8; 32]>,
}

impl Session {
    pub fn current_key(&self) -> Option<&[u8; 32]> {
        self.group_keys.first()
    }

    fn same_member_set(&self, members: &[String]) -> bool {
        let mut a: Vec<&String> = self.members.iter().collect();
        let mut b: Vec<&String> = members.iter().collect();
        a.sort();
        b.sort();
        a == b
    }
}

pub struct KeyStore {
    /// Most-recent-first.
    sessions: Vec<Session>,
    capacity: usize,
    eviction_policy: EvictionPolicy,
}

impl KeyStore {
    pub fn new(capacity: usize, eviction_policy: EvictionPolicy) -> Self {
        Self { sessions: Vec::new(), capacity, eviction_policy }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions, most-recent-first.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn get(&self, sid: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == sid)
    }

    fn get_mut(&mut self, sid: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == sid)
    }

    pub fn most_recent(&self) -> Option<&Session> {
        self.sessions.first()
    }

    pub fn add_session(
        &mut self,
        sid: String,
        members: Vec<String>,
        pub_keys: Vec<Vec<u8>>,
        group_key: [u8; 32],
    ) -> Result<(), HandlerError> {
        if self.get(&sid).is_some() {
            return Err(HandlerError::Inconsistency(format!("session id {sid} already known")));
        }
        if members.len() != pub_keys.len() {
            return Err(HandlerError::Inconsistency(format!(
                "members ({}) and ephemeral public keys ({}) length mismatch",
                members.len(),
                pub_keys.len()
            )));
        }
        for existing in &self.sessions {
            for (m, pk) in members.iter().zip(&pub_keys) {
                if let Some(pos) = existing.members.iter().position(|em| em == m) {
                    if &existing.ephemeral_pub_keys[pos] != pk {
                        return Err(HandlerError::Inconsistency(format!(
                            "ephemeral public key for member {m} disagrees with a prior session"
                        )));
                    }
                }
            }
        }

        self.sessions.insert(0, Session { id: sid, members, ephemeral_pub_keys: pub_keys, group_keys: vec![group_key] });

        if self.sessions.len() > self.capacity {
            match self.eviction_policy {
                EvictionPolicy::Drop => {
                    self.sessions.pop();
                }
                EvictionPolicy::WarnOnly => {
                    warn!(capacity = self.capacity, len = self.sessions.len(), "KeyStore over capacity");
                }
            }
        }
        Ok(())
    }

    pub fn add_group_key(&mut self, sid: &str, key: [u8; 32]) -> Result<(), HandlerError> {
        let is_most_recent = self.sessions.first().map(|s| s.id == sid).unwrap_or(false);
        let session = self
            .get_mut(sid)
            .ok_or_else(|| HandlerError::Inconsistency(format!("no such session {sid}")))?;
        if !session.group_keys.contains(&key) {
            session.group_keys.insert(0, key);
        }
        if !is_most_recent {
            warn!(sid, "adding group key to a session that is not the most recent");
        }
        Ok(())
    }

    pub fn add_group_key_last_session(&mut self, key: [u8; 32]) -> Result<(), HandlerError> {
        let sid = self
            .sessions
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| HandlerError::Precondition("no sessions in store".into()))?;
        self.add_group_key(&sid, key)
    }

    /// If `sid` exists, assert the member set matches as an unordered set,
    /// then add the key; otherwise create a new session.
    pub fn update(
        &mut self,
        sid: String,
        members: Vec<String>,
        pub_keys: Vec<Vec<u8>>,
        key: [u8; 32],
    ) -> Result<(), HandlerError> {
        if let Some(existing) = self.get(&sid) {
            if !existing.same_member_set(&members) {
                return Err(HandlerError::Inconsistency(format!(
                    "update for session {sid} changes the member set; use addSession instead"
                )));
            }
            self.add_group_key(&sid, key)
        } else {
            self.add_session(sid, members, pub_keys, key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(b: u8) -> Vec<u8> {
        vec![b; 32]
    }

    #[test]
    fn capacity_keeps_k_most_recent() {
        let mut store = KeyStore::new(2, EvictionPolicy::Drop);
        for i in 0..4u8 {
            store
                .add_session(format!("s{i}"), vec!["a".into()], vec![pk(i)], [i; 32])
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        let ids: Vec<&str> = store.sessions().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s2"]);
    }

    #[test]
    fn duplicate_session_id_rejected() {
        let mut store = KeyStore::new(10, EvictionPolicy::Drop);
        store.add_session("s0".into(), vec!["a".into()], vec![pk(1)], [1; 32]).unwrap();
        let err = store.add_session("s0".into(), vec!["a".into()], vec![pk(1)], [1; 32]);
        assert!(err.is_err());
    }

    #[test]
    fn conflicting_ephemeral_key_rejected() {
        let mut store = KeyStore::new(10, EvictionPolicy::Drop);
        store.add_session("s0".into(), vec!["a".into()], vec![pk(1)], [1; 32]).unwrap();
        let err = store.add_session("s1".into(), vec!["a".into()], vec![pk(2)], [2; 32]);
        assert!(err.is_err());
    }

    #[test]
    fn add_group_key_prepends_and_dedupes() {
        let mut store = KeyStore::new(10, EvictionPolicy::Drop);
        store.add_session("s0".into(), vec!["a".into()], vec![pk(1)], [1; 32]).unwrap();
        store.add_group_key("s0", [2; 32]).unwrap();
        store.add_group_key("s0", [1; 32]).unwrap();
        let session = store.get("s0").unwrap();
        assert_eq!(session.group_keys, vec![[2; 32], [1; 32]]);
    }
}
