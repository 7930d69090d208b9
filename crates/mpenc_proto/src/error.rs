use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed wire frame: {0}")]
    Malformed(String),

    #[error("invalid padding: {0}")]
    InvalidPadding(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] mpenc_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
