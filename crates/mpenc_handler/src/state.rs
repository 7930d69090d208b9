//! The 7-state greet state machine driving key agreement.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerState {
    Null,
    InitUpflow,
    InitDownflow,
    /// The single post-agreement state; some historical naming calls this
    /// "INITIALISED", treated here as a plain alias.
    Ready,
    AuxUpflow,
    AuxDownflow,
    Quit,
}

impl HandlerState {
    /// Wire state codes used in session-acknowledgement payloads.
    pub fn code(self) -> u8 {
        match self {
            HandlerState::Null => 0,
            HandlerState::InitUpflow => 1,
            HandlerState::InitDownflow => 2,
            HandlerState::Ready => 3,
            HandlerState::AuxUpflow => 4,
            HandlerState::AuxDownflow => 5,
            HandlerState::Quit => 6,
        }
    }

    pub fn is_downflow(self) -> bool {
        matches!(self, HandlerState::InitDownflow | HandlerState::AuxDownflow)
    }
}
