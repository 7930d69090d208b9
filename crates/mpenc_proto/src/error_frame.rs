//! Signed error frames.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Info = 0x00,
    Warning = 0x01,
    Terminal = 0x02,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Terminal => "TERMINAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "TERMINAL" => Some(Severity::Terminal),
            _ => None,
        }
    }
}

/// `?mpENC Error:<signature>:from "<id>":<SEVERITY>:<text>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub from: String,
    pub severity: Severity,
    pub text: String,
    pub signature: Vec<u8>,
}

impl ErrorFrame {
    /// Bytes signed by the sender's ephemeral key: everything but the
    /// signature, so receivers can verify against the claimed signer.
    pub fn signing_bytes(from: &str, severity: Severity, text: &str) -> Vec<u8> {
        format!("{from}:{}:{text}", severity.as_str()).into_bytes()
    }

    pub fn to_wire(&self) -> String {
        format!(
            "?mpENC Error:{}:from \"{}\":{}:{}",
            hex::encode(&self.signature),
            self.from,
            self.severity.as_str(),
            self.text
        )
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("?mpENC Error:")?;
        let mut parts = rest.splitn(4, ':');
        let signature = hex::decode(parts.next()?).ok()?;
        let from_field = parts.next()?;
        let from = from_field
            .strip_prefix("from \"")
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)?;
        let severity = Severity::parse(parts.next()?)?;
        let text = parts.next()?.to_string();
        Some(Self { from, severity, text, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let frame = ErrorFrame {
            from: "alice".into(),
            severity: Severity::Terminal,
            text: "Session authentication by member bob failed".into(),
            signature: vec![1, 2, 3, 4],
        };
        let wire = frame.to_wire();
        let parsed = ErrorFrame::from_wire(&wire).unwrap();
        assert_eq!(parsed.from, frame.from);
        assert_eq!(parsed.severity, frame.severity);
        assert_eq!(parsed.text, frame.text);
        assert_eq!(parsed.signature, frame.signature);
    }
}
