//! Handler-level errors.
//!
//! Precondition violations and protocol inconsistencies are thrown
//! straight to the caller; authentication failure is the sole
//! catch-and-promote path, modelled as a variant rather than a panic so
//! the handler can turn it into a signed TERMINAL error frame; everything
//! else is an assert-and-drop boundary case.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Wrong state for the requested operation, or a required ephemeral key
    /// is missing. No state change occurs.
    #[error("precondition violation: {0}")]
    Precondition(String),

    /// Member-set mismatch, duplicate session id, or ephemeral-key
    /// disagreement. The caller should call `recover()`.
    #[error("protocol inconsistency: {0}")]
    Inconsistency(String),

    /// "Session authentication by member X failed" — caught, promoted to a
    /// TERMINAL error frame, and triggers a local quit.
    #[error("session authentication by member {member_id} failed")]
    AuthFailure { member_id: String },

    #[error("crypto error: {0}")]
    Crypto(#[from] mpenc_crypto::CryptoError),

    #[error("protocol error: {0}")]
    Proto(#[from] mpenc_proto::ProtoError),

    /// Assert-and-drop: a category the handler does not otherwise
    /// recognise.
    #[error("unknown handler error: {0}")]
    Unknown(String),
}
