//! Wire codec: frame classification, protocol-frame (de)serialisation, and
//! padding.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::data::DataEnvelope;
use crate::error::ProtoError;
use crate::error_frame::ErrorFrame;
use crate::greet::GreetMessage;
use crate::query::QueryFrame;

/// The payload carried inside a `?mpENCv<ver>?<base64>.` protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProtocolPayload {
    Greet(GreetMessage),
    Data(DataEnvelope),
}

/// A classified inbound wire frame.
#[derive(Debug, Clone)]
pub enum WireFrame {
    Greet(GreetMessage),
    Data(DataEnvelope),
    Error(ErrorFrame),
    Query(QueryFrame),
    Plaintext(String),
}

/// Encode a protocol frame: `?mpENCv<ver>?<base64>.`
pub fn encode_protocol_frame(version: u8, payload: &ProtocolPayload) -> Result<String, ProtoError> {
    let json = serde_json::to_vec(payload)?;
    let b64 = STANDARD.encode(json);
    Ok(format!("?mpENCv{version}?{b64}."))
}

fn decode_protocol_frame(s: &str) -> Result<ProtocolPayload, ProtoError> {
    let rest = s
        .strip_suffix('.')
        .ok_or_else(|| ProtoError::Malformed("protocol frame missing trailing '.'".into()))?;
    let rest = rest
        .strip_prefix("?mpENCv")
        .ok_or_else(|| ProtoError::Malformed("missing ?mpENCv prefix".into()))?;
    let (_ver, b64) = rest
        .split_once('?')
        .ok_or_else(|| ProtoError::Malformed("missing version separator".into()))?;
    let json = STANDARD.decode(b64)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Classify an inbound wire frame without doing any cryptographic
/// verification — a cheap front end for message inspection.
pub fn classify(s: &str) -> WireFrame {
    if s.starts_with("?mpENC Error:") {
        if let Some(frame) = ErrorFrame::from_wire(s) {
            return WireFrame::Error(frame);
        }
    }
    if s.starts_with("?mpENCv") {
        if s.ends_with('.') {
            if let Ok(payload) = decode_protocol_frame(s) {
                return match payload {
                    ProtocolPayload::Greet(g) => WireFrame::Greet(g),
                    ProtocolPayload::Data(d) => WireFrame::Data(d),
                };
            }
        } else if let Some(q) = QueryFrame::from_wire(s) {
            return WireFrame::Query(q);
        }
    }
    WireFrame::Plaintext(s.to_string())
}

/// Pad `body` to obscure its true length: if `padding_size` is 0, padding
/// is disabled. Otherwise, if `body` fits within `padding_size`, pad to
/// exactly `padding_size`; else pad to the next power-of-two >= len.
/// Wire format: `[original_len: u32 LE] [body] [padding]`.
pub fn pad(body: &[u8], padding_size: u32) -> Vec<u8> {
    let target = if padding_size == 0 {
        4 + body.len()
    } else if (body.len() as u64) <= padding_size as u64 {
        4 + padding_size as usize
    } else {
        (4 + body.len()).next_power_of_two()
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        use rand::RngCore;
        let mut filler = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut filler);
        out.extend_from_slice(&filler);
    }
    out
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_disabled() {
        let padded = pad(b"hi", 0);
        assert_eq!(padded.len(), 4 + 2);
        assert_eq!(unpad(&padded).unwrap(), b"hi");
    }

    #[test]
    fn pad_exact_bound() {
        let padded = pad(b"hi", 128);
        assert_eq!(padded.len(), 4 + 128);
        assert_eq!(unpad(&padded).unwrap(), b"hi");
    }

    #[test]
    fn pad_next_power_of_two_when_over_bound() {
        let body = vec![0x41u8; 200];
        let padded = pad(&body, 128);
        assert_eq!(padded.len(), (4 + 200usize).next_power_of_two());
        assert_eq!(unpad(&padded).unwrap(), body);
    }

    #[test]
    fn query_frame_classified() {
        let q = QueryFrame { version: 1, payload: String::new() };
        match classify(&q.to_wire()) {
            WireFrame::Query(parsed) => assert_eq!(parsed, q),
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn plaintext_falls_through() {
        match classify("hello there") {
            WireFrame::Plaintext(s) => assert_eq!(s, "hello there"),
            other => panic!("expected plaintext, got {other:?}"),
        }
    }
}
