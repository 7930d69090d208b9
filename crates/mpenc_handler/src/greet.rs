//! GreetWrapper — the key-agreement state machine.
//!
//! Combines the CLIQUES-style group DH ladder (`mpenc_crypto::gdh`) with
//! ephemeral signature-key exchange into a single 7-state machine.
//!
//! A `GreetMessage`'s `key_vector` carries the ladder's sub-keys, plus (for
//! upflow messages only) the running cardinal as a final entry — the next
//! contributor on the relay needs it to extend the ladder. The final,
//! completed cardinal is never put on the wire: it *is* the group secret,
//! so downflow broadcasts carry only the finished sub-keys, and every
//! recipient re-derives the cardinal for themselves from their own scalar
//! (see [`pack_upflow_ladder`]/[`unpack_upflow_ladder`] vs.
//! [`pack_downflow_subkeys`]).

use std::sync::Arc;

use mpenc_crypto::gdh::{Contribution, Ladder, LadderPoint};
use mpenc_crypto::hash;
use mpenc_crypto::identity::{EphemeralKeyPair, LongTermKeyPair, PublicKeyBytes};
use mpenc_crypto::kdf;
use mpenc_proto::greet::{GreetDirection, GreetMessage, GreetMessageType, GreetOperation, GreetVariant};

use crate::directory::Directory;
use crate::error::HandlerError;
use crate::state::HandlerState;

fn pack_upflow_ladder(ladder: &Ladder) -> Vec<LadderPoint> {
    let mut v = ladder.sub_keys.clone();
    v.push(ladder.cardinal);
    v
}

fn unpack_upflow_ladder(key_vector: &[LadderPoint]) -> Result<(Vec<LadderPoint>, LadderPoint), HandlerError> {
    let mut v = key_vector.to_vec();
    let cardinal = v
        .pop()
        .ok_or_else(|| HandlerError::Inconsistency("empty key vector in greet message".into()))?;
    Ok((v, cardinal))
}

/// Downflow broadcasts never carry the cardinal — only the finished
/// sub-keys. Each recipient raises their own sub-key entry to their own
/// scalar to derive the (never-transmitted) group secret.
fn pack_downflow_subkeys(ladder: &Ladder) -> Vec<LadderPoint> {
    ladder.sub_keys.clone()
}

/// Material produced the moment a round completes and the local party
/// reaches READY, ready to be installed in the KeyStore.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    pub session_id: String,
    pub members: Vec<String>,
    pub ephemeral_pub_keys: Vec<Vec<u8>>,
    pub group_key: [u8; 32],
}

#[derive(Debug, Clone)]
pub enum GreetOutcome {
    /// Send this message to `dest` only (upflow relay).
    Reply(GreetMessage),
    /// Broadcast this message to the whole member list.
    Broadcast(GreetMessage),
    /// An ack was absorbed; no outbound frame this round.
    NoReply,
    /// The final ack was absorbed; the session is now READY.
    Ready(ReadyInfo),
    /// One last ack is broadcast, and it completes the round.
    BroadcastThenReady(GreetMessage, ReadyInfo),
    /// A local or peer-driven quit; this frame (if any) should be sent.
    Quit(Option<GreetMessage>),
    /// The message was not addressed to us, or came from us; drop silently.
    Ignored,
}

pub struct GreetWrapper {
    self_id: String,
    state: HandlerState,
    recovering: bool,
    members: Vec<String>,
    ephemeral: Option<EphemeralKeyPair>,
    ephemeral_pub_keys: Vec<Vec<u8>>,
    /// Long-term-key signatures binding each entry of `ephemeral_pub_keys`
    /// to its member, index-aligned with both. Empty entries mean "no
    /// long-term key on file for this member" and fall back to
    /// trust-on-first-use.
    ephemeral_bindings: Vec<Vec<u8>>,
    /// This party's own binding for `ephemeral`, carried alongside it so it
    /// survives across the upflow relay without re-deriving it.
    own_ephemeral_binding: Option<Vec<u8>>,
    own_contribution: Option<Contribution>,
    ladder: Option<Ladder>,
    session_id: Option<String>,
    pending_group_key: Option<[u8; 32]>,
    acked: std::collections::HashSet<String>,
    own_long_term: Option<LongTermKeyPair>,
    directory: Option<Arc<dyn Directory>>,
}

impl GreetWrapper {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            state: HandlerState::Null,
            recovering: false,
            members: Vec::new(),
            ephemeral: None,
            ephemeral_pub_keys: Vec::new(),
            ephemeral_bindings: Vec::new(),
            own_ephemeral_binding: None,
            own_contribution: None,
            ladder: None,
            session_id: None,
            pending_group_key: None,
            acked: std::collections::HashSet::new(),
            own_long_term: None,
            directory: None,
        }
    }

    /// Attach a long-term identity and a directory of peers' long-term
    /// public keys, so freshly-generated ephemeral keys are bound to
    /// `self_id` and incoming session acknowledgements are checked against
    /// the directory before being accepted.
    pub fn with_identity(mut self, own_long_term: LongTermKeyPair, directory: Arc<dyn Directory>) -> Self {
        self.own_long_term = Some(own_long_term);
        self.directory = Some(directory);
        self
    }

    /// Generate a fresh ephemeral key for this round, signing its public
    /// half with the long-term key (if any) so peers can bind it to
    /// `self_id` via the directory.
    fn generate_ephemeral(&mut self) {
        let ephemeral = EphemeralKeyPair::generate();
        let binding = self.own_long_term.as_ref().map(|lt| lt.sign(&ephemeral.public.0)).unwrap_or_default();
        self.own_ephemeral_binding = Some(binding);
        self.ephemeral = Some(ephemeral);
    }

    /// Sign `msg` with this round's ephemeral key, filling in
    /// `frame_signature`. A no-op if no ephemeral key has been generated
    /// yet (should not happen for any message this wrapper emits).
    fn sign_frame(&self, mut msg: GreetMessage) -> GreetMessage {
        if let Some(ephemeral) = &self.ephemeral {
            msg.frame_signature = None;
            let bytes = msg.signing_bytes();
            msg.frame_signature = Some(ephemeral.sign(&bytes));
        }
        msg
    }

    /// Verify that `msg` carries a valid ephemeral-key signature from its
    /// claimed sender. Every inbound greet message must pass this before
    /// being dispatched.
    fn verify_frame(&self, msg: &GreetMessage) -> Result<(), HandlerError> {
        let idx = msg
            .members
            .iter()
            .position(|m| m == &msg.source)
            .ok_or_else(|| HandlerError::Inconsistency(format!("frame from unlisted member {}", msg.source)))?;
        let sender_pub = msg
            .ephemeral_pub_keys
            .get(idx)
            .ok_or_else(|| HandlerError::Inconsistency("missing ephemeral public key for sender".into()))?;
        let sig = msg.frame_signature.as_ref().ok_or_else(|| HandlerError::AuthFailure { member_id: msg.source.clone() })?;
        EphemeralKeyPair::verify(sender_pub, &msg.signing_bytes(), sig)
            .map_err(|_| HandlerError::AuthFailure { member_id: msg.source.clone() })?;
        Ok(())
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn recovering(&self) -> bool {
        self.recovering
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The ephemeral signing key for the current round/session, if one has
    /// been established. Used by the handler to sign data messages and
    /// error frames.
    pub fn ephemeral(&self) -> Option<&EphemeralKeyPair> {
        self.ephemeral.as_ref()
    }

    fn own_index(&self) -> Option<usize> {
        self.members.iter().position(|m| m == &self.self_id)
    }

    fn all_acked(&self) -> bool {
        self.acked.len() == self.members.len()
    }

    fn ready_info(&self) -> ReadyInfo {
        ReadyInfo {
            session_id: self.session_id.clone().expect("session id set before ready"),
            members: self.members.clone(),
            ephemeral_pub_keys: self.ephemeral_pub_keys.clone(),
            group_key: self.pending_group_key.expect("group key set before ready"),
        }
    }

    fn transition_ready(&mut self) -> ReadyInfo {
        self.state = HandlerState::Ready;
        self.recovering = false;
        self.ready_info()
    }

    // ---- self-initiated operations ----

    /// Begin the initial group agreement. Only legal from NULL.
    pub fn start(&mut self, others: Vec<String>) -> Result<GreetMessage, HandlerError> {
        if self.state != HandlerState::Null {
            return Err(HandlerError::Precondition(format!("start() requires NULL, got {:?}", self.state)));
        }
        let mut members = vec![self.self_id.clone()];
        members.extend(others);
        if members.len() < 2 {
            return Err(HandlerError::Precondition("start() requires at least one other member".into()));
        }

        let contribution = Contribution::random();
        let ladder = Ladder::seed().extend(contribution)?;
        self.generate_ephemeral();

        self.ephemeral_pub_keys = vec![self.ephemeral.as_ref().expect("just generated").public.0.clone()];
        self.ephemeral_bindings = vec![self.own_ephemeral_binding.clone().unwrap_or_default()];
        self.members = members.clone();
        self.own_contribution = Some(contribution);
        self.ladder = Some(ladder.clone());
        self.state = HandlerState::InitUpflow;
        let ephemeral_pub_keys = self.ephemeral_pub_keys.clone();
        let ephemeral_bindings = self.ephemeral_bindings.clone();

        Ok(self.sign_frame(GreetMessage {
            source: self.self_id.clone(),
            dest: members[1].clone(),
            members,
            key_vector: pack_upflow_ladder(&ladder),
            nonces: vec![],
            ephemeral_pub_keys,
            ephemeral_bindings,
            session_signature: None,
            frame_signature: None,
            quit_signing_key: None,
            message_type: GreetMessageType {
                operation: GreetOperation::Start,
                direction: GreetDirection::Up,
                variant: GreetVariant::Initiator,
                is_recover: self.recovering,
            },
        }))
    }

    /// Add `new_members`, re-running an auxiliary upflow among just the new
    /// positions. Only legal from READY.
    pub fn join(&mut self, new_members: Vec<String>) -> Result<GreetMessage, HandlerError> {
        if self.state != HandlerState::Ready {
            return Err(HandlerError::Precondition(format!("join() requires READY, got {:?}", self.state)));
        }
        if new_members.is_empty() {
            return Err(HandlerError::Precondition("join() requires at least one new member".into()));
        }
        let ladder = self.ladder.clone().ok_or_else(|| HandlerError::Precondition("no established ladder".into()))?;
        let mut members = self.members.clone();
        members.extend(new_members.clone());

        self.members = members.clone();
        self.state = HandlerState::AuxUpflow;
        self.session_id = None;

        Ok(self.sign_frame(GreetMessage {
            source: self.self_id.clone(),
            dest: new_members[0].clone(),
            members,
            key_vector: pack_upflow_ladder(&ladder),
            nonces: vec![],
            ephemeral_pub_keys: self.ephemeral_pub_keys.clone(),
            ephemeral_bindings: self.ephemeral_bindings.clone(),
            session_signature: None,
            frame_signature: None,
            quit_signing_key: None,
            message_type: GreetMessageType {
                operation: GreetOperation::Join,
                direction: GreetDirection::Up,
                variant: GreetVariant::Initiator,
                is_recover: self.recovering,
            },
        }))
    }

    fn exclude_precondition_ok(&self) -> bool {
        self.state == HandlerState::Ready
            || (self.recovering && (self.state == HandlerState::InitDownflow || self.state == HandlerState::AuxDownflow))
    }

    /// Remove `to_exclude`, re-randomising the ladder so excluded members
    /// cannot derive the new key. If only one member would remain, issues
    /// a quit instead (last-man-standing).
    pub fn exclude(&mut self, to_exclude: Vec<String>) -> Result<GreetOutcome, HandlerError> {
        if !self.exclude_precondition_ok() {
            return Err(HandlerError::Precondition(format!("exclude() requires READY, got {:?}", self.state)));
        }
        if to_exclude.iter().any(|m| m == &self.self_id) {
            return Err(HandlerError::Precondition("exclude() may not target self".into()));
        }

        let remaining: Vec<String> = self.members.iter().filter(|m| !to_exclude.contains(m)).cloned().collect();
        if remaining.len() <= 1 {
            let quit_msg = self.quit()?;
            return Ok(GreetOutcome::Quit(Some(quit_msg)));
        }

        let old_index = self.own_index().ok_or_else(|| HandlerError::Inconsistency("self missing from member list".into()))?;
        let drop_indices: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| to_exclude.contains(m))
            .map(|(i, _)| i)
            .collect();

        let old_scalar = self.own_contribution.ok_or_else(|| HandlerError::Precondition("no own contribution".into()))?.0;
        let new_scalar = Contribution::random().0;
        let ladder = self.ladder.clone().ok_or_else(|| HandlerError::Precondition("no established ladder".into()))?;
        let rekeyed = ladder.rekey_self(old_index, old_scalar, new_scalar, &drop_indices)?;

        let new_ephemeral_pub_keys: Vec<Vec<u8>> = self
            .members
            .iter()
            .zip(self.ephemeral_pub_keys.iter())
            .filter(|(m, _)| !to_exclude.contains(m))
            .map(|(_, pk)| pk.clone())
            .collect();
        let new_ephemeral_bindings: Vec<Vec<u8>> = self
            .members
            .iter()
            .zip(self.ephemeral_bindings.iter())
            .filter(|(m, _)| !to_exclude.contains(m))
            .map(|(_, b)| b.clone())
            .collect();

        self.own_contribution = Some(Contribution(new_scalar));
        self.ladder = Some(rekeyed.clone());
        self.members = remaining.clone();
        self.ephemeral_pub_keys = new_ephemeral_pub_keys.clone();
        self.ephemeral_bindings = new_ephemeral_bindings.clone();
        self.state = HandlerState::AuxDownflow;

        let msg = self.broadcast_rekey(GreetOperation::Exclude, remaining, new_ephemeral_pub_keys, new_ephemeral_bindings, rekeyed)?;
        Ok(GreetOutcome::Broadcast(msg))
    }

    /// Re-randomise the ladder for the same member set. Legal from READY,
    /// INIT_DOWNFLOW, or AUX_DOWNFLOW (the latter two only mid-recovery).
    pub fn refresh(&mut self) -> Result<GreetMessage, HandlerError> {
        let ok = self.state == HandlerState::Ready || self.state == HandlerState::InitDownflow || self.state == HandlerState::AuxDownflow;
        if !ok {
            return Err(HandlerError::Precondition(format!("refresh() requires READY/*_DOWNFLOW, got {:?}", self.state)));
        }
        let old_index = self.own_index().ok_or_else(|| HandlerError::Inconsistency("self missing from member list".into()))?;
        let old_scalar = self.own_contribution.ok_or_else(|| HandlerError::Precondition("no own contribution".into()))?.0;
        let new_scalar = Contribution::random().0;
        let ladder = self.ladder.clone().ok_or_else(|| HandlerError::Precondition("no established ladder".into()))?;
        let rekeyed = ladder.rekey_self(old_index, old_scalar, new_scalar, &[])?;

        self.own_contribution = Some(Contribution(new_scalar));
        self.ladder = Some(rekeyed.clone());
        self.state = HandlerState::AuxDownflow;

        let members = self.members.clone();
        let ephemeral_pub_keys = self.ephemeral_pub_keys.clone();
        let ephemeral_bindings = self.ephemeral_bindings.clone();
        self.broadcast_rekey(GreetOperation::Refresh, members, ephemeral_pub_keys, ephemeral_bindings, rekeyed)
    }

    fn broadcast_rekey(
        &mut self,
        operation: GreetOperation,
        members: Vec<String>,
        ephemeral_pub_keys: Vec<Vec<u8>>,
        ephemeral_bindings: Vec<Vec<u8>>,
        ladder: Ladder,
    ) -> Result<GreetMessage, HandlerError> {
        let sid = hash::session_id(&members, &ladder.cardinal);
        let group_key = kdf::derive_group_key(&ladder.cardinal, &sid)?;
        self.session_id = Some(sid.clone());
        self.pending_group_key = Some(group_key);
        self.acked.clear();
        self.acked.insert(self.self_id.clone());

        let ack = GreetMessage::ack_bytes(&sid, &members, &ephemeral_pub_keys);
        let sig = self.ephemeral.as_ref().ok_or_else(|| HandlerError::Precondition("no ephemeral key".into()))?.sign(&ack);

        Ok(self.sign_frame(GreetMessage {
            source: self.self_id.clone(),
            dest: String::new(),
            members,
            key_vector: pack_downflow_subkeys(&ladder),
            nonces: vec![],
            ephemeral_pub_keys,
            ephemeral_bindings,
            session_signature: Some(sig),
            frame_signature: None,
            quit_signing_key: None,
            message_type: GreetMessageType {
                operation,
                direction: GreetDirection::Down,
                variant: GreetVariant::Initiator,
                is_recover: self.recovering,
            },
        }))
    }

    /// Reveal the ephemeral private key and leave the session. Forbidden
    /// from NULL (no ephemeral signing key has ever been established).
    pub fn quit(&mut self) -> Result<GreetMessage, HandlerError> {
        if self.state == HandlerState::Null {
            return Err(HandlerError::Precondition("quit() is forbidden from NULL".into()));
        }
        let ephemeral = self.ephemeral.as_ref().ok_or_else(|| HandlerError::Precondition("no ephemeral key to reveal".into()))?;
        let reveal = ephemeral.quit_reveal();
        let msg = self.sign_frame(GreetMessage {
            source: self.self_id.clone(),
            dest: String::new(),
            members: self.members.clone(),
            key_vector: vec![],
            nonces: vec![],
            ephemeral_pub_keys: self.ephemeral_pub_keys.clone(),
            ephemeral_bindings: self.ephemeral_bindings.clone(),
            session_signature: None,
            frame_signature: None,
            quit_signing_key: Some(reveal),
            message_type: GreetMessageType {
                operation: GreetOperation::Quit,
                direction: GreetDirection::Down,
                variant: GreetVariant::Initiator,
                is_recover: false,
            },
        });
        self.state = HandlerState::Quit;
        Ok(msg)
    }

    /// Re-key after a failure: exclude/refresh if mid-session, else a full
    /// re-initiation. Clears unsettled acks first; `recovering` stays set
    /// until READY is reached.
    pub fn recover(&mut self, to_exclude: Option<Vec<String>>) -> Result<GreetOutcome, HandlerError> {
        self.recovering = true;
        self.acked.clear();

        let can_rekey_in_place =
            self.state == HandlerState::Ready || self.state == HandlerState::InitDownflow || self.state == HandlerState::AuxDownflow;

        if can_rekey_in_place {
            match to_exclude {
                Some(members) if !members.is_empty() => self.exclude(members),
                _ => {
                    self.state = HandlerState::Ready;
                    self.refresh().map(GreetOutcome::Broadcast)
                }
            }
        } else {
            let others: Vec<String> = self.members.iter().filter(|m| **m != self.self_id).cloned().collect();
            self.state = HandlerState::Null;
            self.own_contribution = None;
            self.ephemeral = None;
            self.session_id = None;
            self.start(others).map(GreetOutcome::Reply)
        }
    }

    // ---- inbound dispatch ----

    pub fn recv(&mut self, msg: &GreetMessage) -> Result<GreetOutcome, HandlerError> {
        if msg.source == self.self_id {
            return Ok(GreetOutcome::Ignored);
        }
        if !msg.dest.is_empty() && msg.dest != self.self_id {
            return Ok(GreetOutcome::Ignored);
        }
        if !msg.members.iter().any(|m| m == &self.self_id) {
            self.state = HandlerState::Quit;
            return Ok(GreetOutcome::Quit(None));
        }

        self.verify_frame(msg)?;

        if msg.message_type.is_recover {
            self.recovering = true;
        }

        if msg.message_type.operation == GreetOperation::Quit {
            return self.handle_quit(msg);
        }

        match msg.message_type.direction {
            GreetDirection::Up => self.handle_upflow(msg),
            GreetDirection::Down => self.handle_downflow(msg),
        }
    }

    fn handle_upflow(&mut self, msg: &GreetMessage) -> Result<GreetOutcome, HandlerError> {
        let members = msg.members.clone();
        let (sub_keys, cardinal) = unpack_upflow_ladder(&msg.key_vector)?;
        let mut ladder = Ladder { sub_keys, cardinal };
        let mut ephemeral_pub_keys = msg.ephemeral_pub_keys.clone();
        let mut ephemeral_bindings = msg.ephemeral_bindings.clone();

        let my_index = members
            .iter()
            .position(|m| m == &self.self_id)
            .ok_or_else(|| HandlerError::Inconsistency("self missing from member list".into()))?;

        if self.own_contribution.is_none() {
            self.generate_ephemeral();
            self.own_contribution = Some(Contribution::random());
        }
        let contribution = self.own_contribution.expect("just set");
        ladder = ladder.extend(contribution)?;
        ephemeral_pub_keys.push(self.ephemeral.as_ref().expect("just set").public.0.clone());
        ephemeral_bindings.push(self.own_ephemeral_binding.clone().unwrap_or_default());

        self.members = members.clone();
        self.ephemeral_pub_keys = ephemeral_pub_keys.clone();
        self.ephemeral_bindings = ephemeral_bindings.clone();

        if ladder.sub_keys.len() < members.len() {
            self.state = match msg.message_type.operation {
                GreetOperation::Join => HandlerState::AuxUpflow,
                _ => HandlerState::InitUpflow,
            };
            self.ladder = Some(ladder.clone());
            let next = members[ladder.sub_keys.len()].clone();
            return Ok(GreetOutcome::Reply(self.sign_frame(GreetMessage {
                source: self.self_id.clone(),
                dest: next,
                members,
                key_vector: pack_upflow_ladder(&ladder),
                nonces: msg.nonces.clone(),
                ephemeral_pub_keys,
                ephemeral_bindings,
                session_signature: None,
                frame_signature: None,
                quit_signing_key: None,
                message_type: GreetMessageType { variant: GreetVariant::Participant, ..msg.message_type },
            })));
        }

        // last hop: the ladder is complete. Every member (including this
        // one) independently derives the cardinal and acks.
        self.ladder = Some(ladder.clone());
        self.session_id = None;
        self.finish_round(my_index, &ladder, members, ephemeral_pub_keys, ephemeral_bindings, msg.message_type.operation, None)
    }

    fn handle_downflow(&mut self, msg: &GreetMessage) -> Result<GreetOutcome, HandlerError> {
        let members = msg.members.clone();
        let sub_keys = msg.key_vector.clone();

        let already_have_this_round =
            self.session_id.is_some() && self.ladder.as_ref().map(|l| &l.sub_keys) == Some(&sub_keys);

        if !already_have_this_round {
            let my_index = members
                .iter()
                .position(|m| m == &self.self_id)
                .ok_or_else(|| HandlerError::Inconsistency("self missing from member list".into()))?;
            let own_scalar = self.own_contribution.ok_or_else(|| HandlerError::Precondition("no own contribution".into()))?.0;
            let cardinal = Ladder::complete(&sub_keys, my_index, own_scalar)?;
            self.ladder = Some(Ladder { sub_keys, cardinal });
            self.ephemeral_pub_keys = msg.ephemeral_pub_keys.clone();
            self.ephemeral_bindings = msg.ephemeral_bindings.clone();
            let ladder = self.ladder.clone().expect("just set");
            let outcome = self.finish_round(
                my_index,
                &ladder,
                members,
                msg.ephemeral_pub_keys.clone(),
                msg.ephemeral_bindings.clone(),
                msg.message_type.operation,
                Some(msg),
            )?;
            return Ok(outcome);
        }

        self.verify_and_record_ack(msg)?;
        if self.all_acked() {
            Ok(GreetOutcome::Ready(self.transition_ready()))
        } else {
            Ok(GreetOutcome::NoReply)
        }
    }

    /// Shared tail of both "I just completed the upflow ladder" and "I just
    /// received someone else's downflow broadcast for the first time":
    /// derive the session id and group key, sign an ack, optionally absorb
    /// the triggering message's own ack, and decide whether to broadcast,
    /// finish, or both.
    fn finish_round(
        &mut self,
        _my_index: usize,
        ladder: &Ladder,
        members: Vec<String>,
        ephemeral_pub_keys: Vec<Vec<u8>>,
        ephemeral_bindings: Vec<Vec<u8>>,
        operation: GreetOperation,
        incoming_ack: Option<&GreetMessage>,
    ) -> Result<GreetOutcome, HandlerError> {
        let sid = hash::session_id(&members, &ladder.cardinal);
        let group_key = kdf::derive_group_key(&ladder.cardinal, &sid)?;
        self.session_id = Some(sid.clone());
        self.pending_group_key = Some(group_key);
        self.members = members.clone();
        self.acked.clear();
        self.acked.insert(self.self_id.clone());
        self.state = match operation {
            GreetOperation::Join => HandlerState::AuxDownflow,
            _ => HandlerState::InitDownflow,
        };

        let ack = GreetMessage::ack_bytes(&sid, &members, &ephemeral_pub_keys);
        let sig = self.ephemeral.as_ref().expect("ephemeral set before finish_round").sign(&ack);

        if let Some(incoming) = incoming_ack {
            self.verify_and_record_ack(incoming)?;
        }

        let out = self.sign_frame(GreetMessage {
            source: self.self_id.clone(),
            dest: String::new(),
            members,
            key_vector: pack_downflow_subkeys(ladder),
            nonces: vec![],
            ephemeral_pub_keys,
            ephemeral_bindings,
            session_signature: Some(sig),
            frame_signature: None,
            quit_signing_key: None,
            message_type: GreetMessageType { operation, direction: GreetDirection::Down, variant: GreetVariant::Participant, is_recover: self.recovering },
        });

        if self.all_acked() {
            Ok(GreetOutcome::BroadcastThenReady(out, self.transition_ready()))
        } else {
            Ok(GreetOutcome::Broadcast(out))
        }
    }

    /// Verify a downflow message's own session-acknowledgement signature
    /// and record it. A failure here is the sole catch-and-promote
    /// authentication error in the handler.
    fn verify_and_record_ack(&mut self, msg: &GreetMessage) -> Result<(), HandlerError> {
        if msg.source == self.self_id {
            return Ok(());
        }
        let sid = self.session_id.clone().expect("session id set before verifying acks");
        let idx = self
            .members
            .iter()
            .position(|m| m == &msg.source)
            .ok_or_else(|| HandlerError::Inconsistency(format!("ack from unknown member {}", msg.source)))?;
        let sender_pub = self
            .ephemeral_pub_keys
            .get(idx)
            .ok_or_else(|| HandlerError::Inconsistency("missing ephemeral public key for sender".into()))?;
        let sig = msg
            .session_signature
            .as_ref()
            .ok_or_else(|| HandlerError::Inconsistency("downflow message missing ack signature".into()))?;
        let ack = GreetMessage::ack_bytes(&sid, &self.members, &self.ephemeral_pub_keys);

        EphemeralKeyPair::verify(sender_pub, &ack, sig).map_err(|_| HandlerError::AuthFailure { member_id: msg.source.clone() })?;

        if let Some(directory) = &self.directory {
            if let Some(long_term_pub) = directory.long_term_public(&msg.source) {
                let binding = self.ephemeral_bindings.get(idx).map(|b| b.as_slice()).unwrap_or(&[]);
                if binding.is_empty() {
                    return Err(HandlerError::AuthFailure { member_id: msg.source.clone() });
                }
                LongTermKeyPair::verify(&long_term_pub.0, sender_pub, binding)
                    .map_err(|_| HandlerError::AuthFailure { member_id: msg.source.clone() })?;
            }
        }

        self.acked.insert(msg.source.clone());
        Ok(())
    }

    fn handle_quit(&mut self, msg: &GreetMessage) -> Result<GreetOutcome, HandlerError> {
        if let Some(idx) = self.members.iter().position(|m| m == &msg.source) {
            if let Some(revealed) = msg.quit_signing_key {
                let claimed = EphemeralKeyPair::public_from_revealed(&revealed);
                let known = PublicKeyBytes(self.ephemeral_pub_keys[idx].clone());
                if !claimed.fingerprints_match(&known) {
                    return Err(HandlerError::Inconsistency(format!(
                        "revealed quit key from {} does not match the known ephemeral key",
                        msg.source
                    )));
                }
            }
            self.members.remove(idx);
            self.ephemeral_pub_keys.remove(idx);
            if idx < self.ephemeral_bindings.len() {
                self.ephemeral_bindings.remove(idx);
            }
            self.acked.remove(&msg.source);
        }
        Ok(GreetOutcome::NoReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a full 3-party start to READY, including every downflow ack
    /// broadcast a uniprocess simulation would otherwise have to relay.
    fn drive_three_party_start() -> (GreetWrapper, GreetWrapper, GreetWrapper, ReadyInfo) {
        let mut one = GreetWrapper::new("1");
        let mut two = GreetWrapper::new("2");
        let mut three = GreetWrapper::new("3");

        let m1_to_2 = one.start(vec!["2".into(), "3".into()]).unwrap();
        assert_eq!(one.state(), HandlerState::InitUpflow);

        let m2_to_3 = match two.recv(&m1_to_2).unwrap() {
            GreetOutcome::Reply(m) => m,
            other => panic!("expected upflow reply, got {other:?}"),
        };
        assert_eq!(two.state(), HandlerState::InitUpflow);

        let down_from_3 = match three.recv(&m2_to_3).unwrap() {
            GreetOutcome::Broadcast(m) => m,
            other => panic!("expected downflow broadcast, got {other:?}"),
        };
        assert_eq!(three.state(), HandlerState::InitDownflow);

        let down_from_1 = match one.recv(&down_from_3).unwrap() {
            GreetOutcome::Broadcast(m) => m,
            other => panic!("expected member 1 to ack, got {other:?}"),
        };
        let down_from_2 = match two.recv(&down_from_3).unwrap() {
            GreetOutcome::Broadcast(m) => m,
            other => panic!("expected member 2 to ack, got {other:?}"),
        };

        let ready2 = match two.recv(&down_from_1).unwrap() {
            GreetOutcome::Ready(r) => r,
            other => panic!("expected member 2 ready, got {other:?}"),
        };
        assert_eq!(two.state(), HandlerState::Ready);

        let mid3 = three.recv(&down_from_1).unwrap();
        assert!(matches!(mid3, GreetOutcome::NoReply), "expected member 3 still waiting, got {mid3:?}");

        let ready1 = match one.recv(&down_from_2).unwrap() {
            GreetOutcome::Ready(r) => r,
            other => panic!("expected member 1 ready, got {other:?}"),
        };
        assert_eq!(one.state(), HandlerState::Ready);

        let ready3 = match three.recv(&down_from_2).unwrap() {
            GreetOutcome::Ready(r) => r,
            other => panic!("expected member 3 ready, got {other:?}"),
        };
        assert_eq!(three.state(), HandlerState::Ready);

        assert_eq!(ready1.group_key, ready2.group_key);
        assert_eq!(ready2.group_key, ready3.group_key);
        assert_eq!(ready1.session_id, ready3.session_id);

        (one, two, three, ready1)
    }

    #[test]
    fn three_party_agreement_reaches_ready_with_identical_key() {
        let (one, two, three, ready) = drive_three_party_start();
        let expected = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        assert_eq!(one.members(), expected.as_slice());
        assert_eq!(two.members(), expected.as_slice());
        assert_eq!(three.members(), expected.as_slice());
        assert_eq!(ready.members, expected);
    }

    #[test]
    fn last_man_standing_issues_quit_instead_of_exclude() {
        let mut a = GreetWrapper::new("a");
        let mut b = GreetWrapper::new("b");
        let m = a.start(vec!["b".into()]).unwrap();
        let down = match b.recv(&m).unwrap() {
            GreetOutcome::Broadcast(m) => m,
            other => panic!("expected downflow broadcast, got {other:?}"),
        };
        match a.recv(&down).unwrap() {
            GreetOutcome::BroadcastThenReady(_, _) => {}
            other => panic!("expected member a ready, got {other:?}"),
        }
        assert_eq!(a.state(), HandlerState::Ready);

        match a.exclude(vec!["b".into()]).unwrap() {
            GreetOutcome::Quit(Some(msg)) => {
                assert_eq!(msg.message_type.operation, GreetOperation::Quit);
            }
            other => panic!("expected quit, got {other:?}"),
        }
        assert_eq!(a.state(), HandlerState::Quit);
    }

    #[test]
    fn start_is_rejected_outside_null() {
        let mut one = GreetWrapper::new("1");
        one.start(vec!["2".into()]).unwrap();
        assert!(one.start(vec!["3".into()]).is_err());
    }

    #[test]
    fn member_list_excluding_self_forces_quit() {
        let mut one = GreetWrapper::new("1");
        let mut two = GreetWrapper::new("2");
        let m1_to_2 = one.start(vec!["2".into(), "3".into()]).unwrap();
        let m2_to_3 = match two.recv(&m1_to_2).unwrap() {
            GreetOutcome::Reply(m) => m,
            other => panic!("expected upflow reply, got {other:?}"),
        };
        let mut three = GreetWrapper::new("3");
        let broadcast = match three.recv(&m2_to_3).unwrap() {
            GreetOutcome::Broadcast(m) => m,
            other => panic!("expected downflow broadcast, got {other:?}"),
        };
        assert!(broadcast.dest.is_empty());

        // an outsider not named in the member list receives the (broadcast)
        // downflow frame and must quit immediately.
        let mut outsider = GreetWrapper::new("4");
        let outcome = outsider.recv(&broadcast).unwrap();
        assert!(matches!(outcome, GreetOutcome::Quit(None)));
        assert_eq!(outsider.state(), HandlerState::Quit);
    }
}
