//! mpenc_handler — group key agreement state machine and protocol handler
//! façade.
//!
//! # Module layout
//! - `state`            — the 7-state `HandlerState` machine
//! - `keystore`          — ordered cache of sub-sessions
//! - `trial_buffer`      — bounded FIFO retry queue for undecryptable data
//! - `greet`             — the CLIQUES + ASKE key-agreement engine
//! - `message_security`  — per-session data message encrypt/decrypt
//! - `directory`         — external long-term-key lookup contract
//! - `handler`           — the `ProtocolHandler` façade
//! - `error`             — unified error type

pub mod directory;
pub mod error;
pub mod greet;
pub mod handler;
pub mod keystore;
pub mod message_security;
pub mod state;
pub mod trial_buffer;

pub use directory::{Directory, StaticDirectory};
pub use error::HandlerError;
pub use handler::{HandlerConfig, Inspection, ProtocolHandler, UiEvent};
pub use state::HandlerState;
