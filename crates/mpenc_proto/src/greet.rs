//! Greet frames — the key-agreement control messages.

use serde::{Deserialize, Serialize};

/// One of the five key-agreement flows a greet message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetOperation {
    Start,
    Join,
    Exclude,
    Refresh,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetVariant {
    Initiator,
    Participant,
}

/// The packed message-type byte: `{operation, direction, variant, isRecover}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetMessageType {
    pub operation: GreetOperation,
    pub direction: GreetDirection,
    pub variant: GreetVariant,
    pub is_recover: bool,
}

impl GreetMessageType {
    pub fn to_byte(self) -> u8 {
        let op = match self.operation {
            GreetOperation::Start => 0,
            GreetOperation::Join => 1,
            GreetOperation::Exclude => 2,
            GreetOperation::Refresh => 3,
            GreetOperation::Quit => 4,
        };
        let dir: u8 = match self.direction {
            GreetDirection::Up => 0,
            GreetDirection::Down => 1,
        };
        let variant: u8 = match self.variant {
            GreetVariant::Initiator => 0,
            GreetVariant::Participant => 1,
        };
        (op << 4) | (dir << 3) | (variant << 2) | (self.is_recover as u8)
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        let operation = match (b >> 4) & 0x0F {
            0 => GreetOperation::Start,
            1 => GreetOperation::Join,
            2 => GreetOperation::Exclude,
            3 => GreetOperation::Refresh,
            4 => GreetOperation::Quit,
            _ => return None,
        };
        let direction = if (b >> 3) & 1 == 0 { GreetDirection::Up } else { GreetDirection::Down };
        let variant = if (b >> 2) & 1 == 0 { GreetVariant::Initiator } else { GreetVariant::Participant };
        let is_recover = b & 1 == 1;
        Some(Self { operation, direction, variant, is_recover })
    }
}

/// A single greet (key-agreement) frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetMessage {
    pub source: String,
    /// Empty string means broadcast.
    pub dest: String,
    pub members: Vec<String>,
    /// The CLIQUES ladder's sub-key vector (or a single new cardinal entry
    /// while relaying upflow), base64-agnostic raw 32-byte points.
    pub key_vector: Vec<[u8; 32]>,
    pub nonces: Vec<[u8; 32]>,
    /// Ephemeral signing public keys, index-aligned with `members`.
    pub ephemeral_pub_keys: Vec<Vec<u8>>,
    /// Long-term-key signatures over the corresponding entry of
    /// `ephemeral_pub_keys`, index-aligned with `members`. Empty for a
    /// member with no long-term key on file.
    pub ephemeral_bindings: Vec<Vec<u8>>,
    /// Signature over (session_id, members, ephemeral_pub_keys), present on
    /// downflow acknowledgements.
    pub session_signature: Option<Vec<u8>>,
    /// Signature over [`signing_bytes`] made with the sender's ephemeral
    /// key, present on every greet message.
    pub frame_signature: Option<Vec<u8>>,
    /// Revealed on quit: the sender's ephemeral private signing key.
    pub quit_signing_key: Option<[u8; 32]>,
    pub message_type: GreetMessageType,
}

impl GreetMessage {
    /// Bytes signed by the sender's ephemeral key: every field but the
    /// frame signature itself (and the unrelated session-ack signature,
    /// which is signed separately over [`ack_bytes`]).
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.session_signature = None;
        unsigned.frame_signature = None;
        serde_json::to_vec(&unsigned).expect("GreetMessage always serialises")
    }

    /// Bytes a session acknowledgement is made over: (session_id, members,
    /// ephemeral_pub_keys).
    pub fn ack_bytes(session_id: &str, members: &[String], ephemeral_pub_keys: &[Vec<u8>]) -> Vec<u8> {
        let tuple = (session_id, members, ephemeral_pub_keys);
        serde_json::to_vec(&tuple).expect("ack tuple always serialises")
    }
}
