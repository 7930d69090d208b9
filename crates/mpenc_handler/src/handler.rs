//! ProtocolHandler — the façade over GreetWrapper, KeyStore, and
//! per-session message encrypt/decrypt.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{info, warn};

use mpenc_crypto::identity::{EphemeralKeyPair, LongTermKeyPair};
use mpenc_proto::codec::{self, WireFrame};
use mpenc_proto::data::DataEnvelope;
use mpenc_proto::error_frame::{ErrorFrame, Severity};
use mpenc_proto::greet::{GreetDirection, GreetMessage, GreetOperation, GreetVariant};
use mpenc_proto::query::QueryFrame;

use crate::directory::Directory;
use crate::error::HandlerError;
use crate::greet::{GreetOutcome, GreetWrapper};
use crate::keystore::{EvictionPolicy, KeyStore};
use crate::message_security;
use crate::trial_buffer::{TrialBuffer, TrialTarget};

pub const PROTOCOL_VERSION: u8 = mpenc_proto::data::PROTOCOL_VERSION;
pub const DEFAULT_PADDING: u32 = 128;

#[derive(Debug, Clone)]
pub enum UiEvent {
    Info(String),
    Warning(String),
    Terminal(String),
}

/// Negotiation origin of a greet frame, as reported by `inspect_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetOrigin {
    Initiator,
    Participant,
    Outsider,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct GreetInspection {
    pub origin: GreetOrigin,
    pub negotiation: String,
}

#[derive(Debug, Clone)]
pub enum Inspection {
    Plaintext,
    Query,
    Error,
    Data,
    Greet(GreetInspection),
}

pub struct HandlerConfig {
    pub keystore_capacity: usize,
    pub keystore_eviction: EvictionPolicy,
    pub trial_buffer_max: usize,
    pub default_padding: u32,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            keystore_capacity: 20,
            keystore_eviction: EvictionPolicy::Drop,
            trial_buffer_max: 32,
            default_padding: DEFAULT_PADDING,
        }
    }
}

impl HandlerConfig {
    /// Build a config, rejecting padding sizes that would defeat the point
    /// of padding (too small to hide a short message's length) or waste
    /// bandwidth absurdly. `0` disables padding outright and is always
    /// accepted.
    pub fn new(
        keystore_capacity: usize,
        keystore_eviction: EvictionPolicy,
        trial_buffer_max: usize,
        default_padding: u32,
    ) -> Result<Self, HandlerError> {
        if default_padding != 0 && default_padding < 16 {
            return Err(HandlerError::Precondition(format!(
                "default_padding must be 0 or at least 16 bytes, got {default_padding}"
            )));
        }
        if default_padding > 1 << 20 {
            return Err(HandlerError::Precondition(format!(
                "default_padding {default_padding} exceeds the 1 MiB sanity bound"
            )));
        }
        if keystore_capacity == 0 {
            return Err(HandlerError::Precondition("keystore_capacity must be at least 1".into()));
        }
        Ok(Self { keystore_capacity, keystore_eviction, trial_buffer_max, default_padding })
    }
}

struct TrialItem {
    packet: DataEnvelope,
    claimed_author: String,
}

struct TrialResolver<'a> {
    keystore: &'a KeyStore,
    max_size: usize,
    resolved: Vec<(String, Vec<u8>, Vec<String>)>,
}

impl<'a> TrialTarget<TrialItem> for TrialResolver<'a> {
    fn try_me(&mut self, _pending: bool, item: &TrialItem) -> bool {
        let candidates: Vec<&crate::keystore::Session> = self.keystore.sessions().collect();
        match message_security::decrypt(&item.packet, &item.claimed_author, &candidates) {
            Some(decrypted) => {
                self.resolved.push((item.claimed_author.clone(), decrypted.body, decrypted.parents));
                true
            }
            None => false,
        }
    }

    fn param_id(&self, item: &TrialItem) -> String {
        hex::encode(&item.packet.signature)
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}

/// The three priority outbound queues and the handler state.
pub struct ProtocolHandler {
    self_id: String,
    config: HandlerConfig,
    greet: GreetWrapper,
    keystore: KeyStore,
    trial_buffer: TrialBuffer<TrialItem>,

    pub protocol_out_queue: VecDeque<String>,
    pub message_out_queue: VecDeque<String>,
    pub ui_queue: VecDeque<UiEvent>,

    on_queue_updated: Option<Box<dyn FnMut(&ProtocolHandlerSnapshot)>>,
    on_state_updated: Option<Box<dyn FnMut(&ProtocolHandlerSnapshot)>>,
}

/// A cheap, cloneable view of handler state passed to callbacks so they
/// cannot retain a mutable back-reference into the handler.
#[derive(Debug, Clone)]
pub struct ProtocolHandlerSnapshot {
    pub state: crate::state::HandlerState,
    pub protocol_out_len: usize,
    pub message_out_len: usize,
    pub ui_len: usize,
}

impl ProtocolHandler {
    pub fn new(self_id: impl Into<String>, config: HandlerConfig) -> Self {
        let self_id = self_id.into();
        Self {
            keystore: KeyStore::new(config.keystore_capacity, config.keystore_eviction),
            trial_buffer: TrialBuffer::new(),
            greet: GreetWrapper::new(self_id.clone()),
            self_id,
            config,
            protocol_out_queue: VecDeque::new(),
            message_out_queue: VecDeque::new(),
            ui_queue: VecDeque::new(),
            on_queue_updated: None,
            on_state_updated: None,
        }
    }

    /// Build a handler bound to a long-term identity and a directory of
    /// peers' long-term public keys: ephemeral keys generated during key
    /// agreement are signed with `own_long_term`, and incoming session
    /// acknowledgements are checked against `directory` before being
    /// accepted.
    pub fn with_identity(
        self_id: impl Into<String>,
        config: HandlerConfig,
        own_long_term: LongTermKeyPair,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let self_id = self_id.into();
        Self {
            keystore: KeyStore::new(config.keystore_capacity, config.keystore_eviction),
            trial_buffer: TrialBuffer::new(),
            greet: GreetWrapper::new(self_id.clone()).with_identity(own_long_term, directory),
            self_id,
            config,
            protocol_out_queue: VecDeque::new(),
            message_out_queue: VecDeque::new(),
            ui_queue: VecDeque::new(),
            on_queue_updated: None,
            on_state_updated: None,
        }
    }

    pub fn state(&self) -> crate::state::HandlerState {
        self.greet.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.greet.session_id()
    }

    pub fn members(&self) -> &[String] {
        self.greet.members()
    }

    pub fn recovering(&self) -> bool {
        self.greet.recovering()
    }

    pub fn current_group_key(&self) -> Option<[u8; 32]> {
        self.keystore.most_recent().and_then(|s| s.current_key().copied())
    }

    pub fn set_on_queue_updated(&mut self, f: impl FnMut(&ProtocolHandlerSnapshot) + 'static) {
        self.on_queue_updated = Some(Box::new(f));
    }

    pub fn set_on_state_updated(&mut self, f: impl FnMut(&ProtocolHandlerSnapshot) + 'static) {
        self.on_state_updated = Some(Box::new(f));
    }

    fn snapshot(&self) -> ProtocolHandlerSnapshot {
        ProtocolHandlerSnapshot {
            state: self.greet.state(),
            protocol_out_len: self.protocol_out_queue.len(),
            message_out_len: self.message_out_queue.len(),
            ui_len: self.ui_queue.len(),
        }
    }

    fn fire_queue_updated(&mut self) {
        let snap = self.snapshot();
        if let Some(cb) = self.on_queue_updated.as_mut() {
            cb(&snap);
        }
    }

    fn fire_state_updated(&mut self) {
        let snap = self.snapshot();
        if let Some(cb) = self.on_state_updated.as_mut() {
            cb(&snap);
        }
    }

    fn enqueue_protocol(&mut self, frame: String) {
        self.protocol_out_queue.push_back(frame);
        self.fire_queue_updated();
    }

    fn enqueue_ui(&mut self, event: UiEvent) {
        self.ui_queue.push_back(event);
        self.fire_queue_updated();
    }

    fn encode_greet(&self, msg: &GreetMessage) -> Result<String, HandlerError> {
        let payload = codec::ProtocolPayload::Greet(msg.clone());
        Ok(codec::encode_protocol_frame(PROTOCOL_VERSION, &payload)?)
    }

    fn encode_data(&self, env: &DataEnvelope) -> Result<String, HandlerError> {
        let payload = codec::ProtocolPayload::Data(env.clone());
        Ok(codec::encode_protocol_frame(PROTOCOL_VERSION, &payload)?)
    }

    /// Install a newly-agreed session into the KeyStore and log it at
    /// info level.
    fn install_ready(&mut self, info: crate::greet::ReadyInfo) -> Result<(), HandlerError> {
        info!(session_id = %info.session_id, members = ?info.members, "greet session ready");
        self.keystore.update(info.session_id, info.members, info.ephemeral_pub_keys, info.group_key)?;
        self.resweep_trial_buffer();
        Ok(())
    }

    fn resweep_trial_buffer(&mut self) {
        let mut resolver = TrialResolver { keystore: &self.keystore, max_size: self.config.trial_buffer_max, resolved: vec![] };
        self.trial_buffer.resweep(&mut resolver);
        for (_author, body, _parents) in resolver.resolved {
            self.ui_queue.push_back(UiEvent::Info(format!("decrypted {} bytes", body.len())));
        }
        self.fire_queue_updated();
    }

    fn handle_greet_outcome(&mut self, outcome: GreetOutcome) -> Result<(), HandlerError> {
        match outcome {
            GreetOutcome::Reply(msg) | GreetOutcome::Broadcast(msg) => {
                let frame = self.encode_greet(&msg)?;
                self.enqueue_protocol(frame);
            }
            GreetOutcome::BroadcastThenReady(msg, info) => {
                let frame = self.encode_greet(&msg)?;
                self.enqueue_protocol(frame);
                self.install_ready(info)?;
                self.fire_state_updated();
            }
            GreetOutcome::Ready(info) => {
                self.install_ready(info)?;
                self.fire_state_updated();
            }
            GreetOutcome::Quit(maybe_msg) => {
                if let Some(msg) = maybe_msg {
                    let frame = self.encode_greet(&msg)?;
                    self.enqueue_protocol(frame);
                }
                self.fire_state_updated();
            }
            GreetOutcome::NoReply | GreetOutcome::Ignored => {}
        }
        Ok(())
    }

    /// Begin the initial agreement with `others`.
    pub fn start(&mut self, others: Vec<String>) -> Result<(), HandlerError> {
        let msg = self.greet.start(others)?;
        self.fire_state_updated();
        self.handle_greet_outcome(GreetOutcome::Reply(msg))
    }

    pub fn join(&mut self, new_members: Vec<String>) -> Result<(), HandlerError> {
        let msg = self.greet.join(new_members)?;
        self.fire_state_updated();
        self.handle_greet_outcome(GreetOutcome::Reply(msg))
    }

    pub fn exclude(&mut self, to_exclude: Vec<String>) -> Result<(), HandlerError> {
        let outcome = self.greet.exclude(to_exclude)?;
        self.fire_state_updated();
        self.handle_greet_outcome(outcome)
    }

    pub fn refresh(&mut self) -> Result<(), HandlerError> {
        let msg = self.greet.refresh()?;
        self.fire_state_updated();
        self.handle_greet_outcome(GreetOutcome::Broadcast(msg))
    }

    pub fn quit(&mut self) -> Result<(), HandlerError> {
        let msg = self.greet.quit()?;
        self.fire_state_updated();
        self.handle_greet_outcome(GreetOutcome::Quit(Some(msg)))
    }

    /// Recover from a stall or failure: re-key in place if a session was
    /// already established, otherwise re-run the full agreement.
    pub fn recover(&mut self, to_exclude: Option<Vec<String>>) -> Result<(), HandlerError> {
        let outcome = self.greet.recover(to_exclude)?;
        self.fire_state_updated();
        self.handle_greet_outcome(outcome)
    }

    /// Route an inbound wire frame to the appropriate subsystem. `from` is
    /// the transport-level sender, used to target a reply when the frame
    /// itself carries no addressing (a bare query).
    pub fn process_message(&mut self, wire: &str, from: &str) -> Result<(), HandlerError> {
        match codec::classify(wire) {
            WireFrame::Plaintext(_text) => {
                let query = QueryFrame { version: PROTOCOL_VERSION, payload: String::new() };
                self.enqueue_protocol(query.to_wire());
                self.enqueue_ui(UiEvent::Info("received plaintext; requesting a secure session".into()));
                Ok(())
            }
            // A bare query while idle begins a fresh agreement with its
            // sender. Outside NULL, a session is already underway or has
            // just ended and re-opening one here would race a concurrent
            // start/quit, so the query is dropped.
            WireFrame::Query(_query) => {
                if self.greet.state() == crate::state::HandlerState::Null && !from.is_empty() {
                    self.start(vec![from.to_string()])
                } else {
                    Ok(())
                }
            }
            WireFrame::Greet(msg) => match self.greet.recv(&msg) {
                Ok(outcome) => self.handle_greet_outcome(outcome),
                Err(HandlerError::AuthFailure { member_id }) => {
                    self.send_error(Severity::Terminal, &format!("session authentication by member {member_id} failed"))
                }
                Err(other) => Err(other),
            },
            WireFrame::Data(packet) => {
                if self.greet.state() != crate::state::HandlerState::Ready {
                    return Err(HandlerError::Precondition(format!(
                        "data message received outside READY (state = {:?})",
                        self.greet.state()
                    )));
                }
                let item = TrialItem { packet: packet.clone(), claimed_author: packet.source.clone() };
                let mut resolver = TrialResolver { keystore: &self.keystore, max_size: self.config.trial_buffer_max, resolved: vec![] };
                self.trial_buffer.trial(&mut resolver, item);
                for (_author, body, _parents) in resolver.resolved {
                    self.ui_queue.push_back(UiEvent::Info(format!("decrypted {} bytes", body.len())));
                }
                self.fire_queue_updated();
                Ok(())
            }
            WireFrame::Error(frame) => self.process_error_frame(frame),
        }
    }

    fn process_error_frame(&mut self, frame: ErrorFrame) -> Result<(), HandlerError> {
        let verified = self
            .keystore
            .most_recent()
            .and_then(|s| s.members.iter().position(|m| m == &frame.from).map(|i| s.ephemeral_pub_keys[i].clone()))
            .map(|pub_key| {
                let signing_bytes = ErrorFrame::signing_bytes(&frame.from, frame.severity, &frame.text);
                EphemeralKeyPair::verify(&pub_key, &signing_bytes, &frame.signature).is_ok()
            })
            .unwrap_or(false);

        if !verified {
            warn!(from = %frame.from, "error frame failed signature verification; treating as info");
        }

        match frame.severity {
            Severity::Info => self.enqueue_ui(UiEvent::Info(frame.text)),
            Severity::Warning => self.enqueue_ui(UiEvent::Warning(frame.text)),
            Severity::Terminal => {
                self.enqueue_ui(UiEvent::Terminal(format!("TERMINAL ERROR: {}", frame.text)));
                self.quit()?;
            }
        }
        Ok(())
    }

    /// A cheap, non-cryptographic classifier for UI previews: identifies
    /// the frame kind and, for greet frames, who originated the
    /// negotiation without verifying any signature.
    pub fn inspect_message(&self, wire: &str) -> Inspection {
        match codec::classify(wire) {
            WireFrame::Plaintext(_) => Inspection::Plaintext,
            WireFrame::Query(_) => Inspection::Query,
            WireFrame::Error(_) => Inspection::Error,
            WireFrame::Data(_) => Inspection::Data,
            WireFrame::Greet(msg) => {
                let origin = if msg.source == self.self_id {
                    GreetOrigin::Outsider
                } else if !msg.members.iter().any(|m| m == &self.self_id) {
                    GreetOrigin::Outsider
                } else if msg.message_type.variant == GreetVariant::Initiator {
                    GreetOrigin::Initiator
                } else {
                    GreetOrigin::Participant
                };

                let involved = msg.members.iter().any(|m| m == &self.self_id);
                let op = match msg.message_type.operation {
                    GreetOperation::Start => "start",
                    GreetOperation::Join => "join",
                    GreetOperation::Exclude => "exclude",
                    GreetOperation::Refresh => "refresh",
                    GreetOperation::Quit => "quit",
                };
                let targeted = msg.dest == self.self_id || msg.dest.is_empty();
                let negotiation = if !involved {
                    format!("{op} (not involved)")
                } else if msg.message_type.direction == GreetDirection::Up && targeted {
                    format!("{op} me")
                } else {
                    format!("{op} other")
                };

                Inspection::Greet(GreetInspection { origin, negotiation })
            }
        }
    }

    /// Encrypt and broadcast `text` under the current group key. Requires
    /// READY.
    pub fn send(&mut self, text: &str, parents: Vec<String>) -> Result<(), HandlerError> {
        if self.greet.state() != crate::state::HandlerState::Ready {
            return Err(HandlerError::Precondition("send() requires READY".into()));
        }
        let session = self.keystore.most_recent().ok_or_else(|| HandlerError::Precondition("no session established".into()))?;
        let ephemeral = self.greet.ephemeral().ok_or_else(|| HandlerError::Precondition("no ephemeral key for this session".into()))?;
        let packet = message_security::encrypt(text.as_bytes(), session, ephemeral, &self.self_id, "", parents, self.config.default_padding)?;
        let frame = self.encode_data(&packet)?;
        self.message_out_queue.push_back(frame);
        self.fire_queue_updated();
        Ok(())
    }

    /// Directed send: confidential to the recipient's key material no more
    /// than a broadcast is, since anyone in the group session can read it.
    pub fn send_to(&mut self, text: &str, to: &str, parents: Vec<String>) -> Result<(), HandlerError> {
        warn!("sendTo() is not confidential with respect to other group members");
        if self.greet.state() != crate::state::HandlerState::Ready {
            return Err(HandlerError::Precondition("sendTo() requires READY".into()));
        }
        let session = self.keystore.most_recent().ok_or_else(|| HandlerError::Precondition("no session established".into()))?;
        let ephemeral = self.greet.ephemeral().ok_or_else(|| HandlerError::Precondition("no ephemeral key for this session".into()))?;
        let packet = message_security::encrypt(text.as_bytes(), session, ephemeral, &self.self_id, to, parents, self.config.default_padding)?;
        let frame = self.encode_data(&packet)?;
        self.message_out_queue.push_back(frame);
        self.fire_queue_updated();
        Ok(())
    }

    pub fn send_error(&mut self, severity: Severity, text: &str) -> Result<(), HandlerError> {
        let ephemeral = self.greet.ephemeral().ok_or_else(|| HandlerError::Precondition("no ephemeral key to sign error frame".into()))?;
        let signing_bytes = ErrorFrame::signing_bytes(&self.self_id, severity, text);
        let signature = ephemeral.sign(&signing_bytes);
        let frame = ErrorFrame { from: self.self_id.clone(), severity, text: text.to_string(), signature };
        self.enqueue_protocol(frame.to_wire());
        if severity == Severity::Terminal {
            self.quit()?;
        }
        Ok(())
    }
}
