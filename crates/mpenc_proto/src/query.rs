//! Query (handshake request) frames — `?mpENCv<ver>?<payload>?`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFrame {
    pub version: u8,
    pub payload: String,
}

impl QueryFrame {
    pub fn to_wire(&self) -> String {
        format!("?mpENCv{}?{}?", self.version, self.payload)
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("?mpENCv")?;
        let (ver_str, rest) = rest.split_once('?')?;
        let payload = rest.strip_suffix('?')?;
        let version = ver_str.parse().ok()?;
        Some(Self { version, payload: payload.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let q = QueryFrame { version: 1, payload: "".into() };
        assert_eq!(QueryFrame::from_wire(&q.to_wire()), Some(q));
    }
}
