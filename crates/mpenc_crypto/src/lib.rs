//! mpenc_crypto — cryptographic primitives for the mpenc group-chat protocol
//!
//! # Design principles
//! - No custom primitives; everything comes from audited Rust crates.
//! - Secret material is zeroized on drop.
//! - Public types are opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — long-term and ephemeral Ed25519 signing keys
//! - `gdh`      — the CLIQUES-style group Diffie-Hellman ladder
//! - `kdf`      — HKDF-based group key and generic key derivation
//! - `aead`     — XChaCha20-Poly1305 encrypt/decrypt for data messages
//! - `hash`     — BLAKE3 session id derivation and trial hints
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod gdh;
pub mod hash;
pub mod identity;
pub mod kdf;

pub use error::CryptoError;
