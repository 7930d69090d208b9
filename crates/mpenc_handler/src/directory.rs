//! External collaborator contract: long-term signing-key lookup. Key
//! distribution and trust establishment are left to the embedder; this
//! crate only needs a way to ask "what is this member's long-term public
//! key" when one is available.

use mpenc_crypto::identity::PublicKeyBytes;

pub trait Directory {
    fn long_term_public(&self, member_id: &str) -> Option<PublicKeyBytes>;
}

/// An in-memory directory, useful for tests and single-process
/// deployments.
#[derive(Default)]
pub struct StaticDirectory {
    entries: std::collections::HashMap<String, PublicKeyBytes>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member_id: impl Into<String>, public: PublicKeyBytes) {
        self.entries.insert(member_id.into(), public);
    }
}

impl Directory for StaticDirectory {
    fn long_term_public(&self, member_id: &str) -> Option<PublicKeyBytes> {
        self.entries.get(member_id).cloned()
    }
}
