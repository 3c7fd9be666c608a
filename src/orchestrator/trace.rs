use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// W3C Trace Context carrier flowed on every frame. The `traceparent`
/// header is the wire format; the structured `trace_context` JSON carrier
/// mirrors it for producers that cannot emit headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default = "default_trace_flags", deserialize_with = "trace_flags")]
    pub trace_flags: u8,
}

fn default_trace_flags() -> u8 {
    1
}

// Producers write trace_flags either as a number or as a two-digit hex
// string ("01"); accept both.
fn trace_flags<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u8),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => u8::from_str_radix(text.trim(), 16)
            .map_err(|_| serde::de::Error::custom(format!("invalid trace_flags '{text}'"))),
    }
}

const TRACEPARENT_VERSION: &str = "00";

impl TraceContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(32),
            span_id: random_hex(16),
            trace_flags: 1,
        }
    }

    /// Derives a child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(16),
            trace_flags: self.trace_flags,
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "{TRACEPARENT_VERSION}-{}-{}-{:02x}",
            self.trace_id, self.span_id, self.trace_flags
        )
    }

    /// Strict parse of a `traceparent` header: `00-<32 hex>-<16 hex>-<2 hex>`
    /// with non-zero trace and span ids.
    pub fn parse_traceparent(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        if version.len() != 2 || !is_lower_hex(version) || version == "ff" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            trace_flags: u8::from_str_radix(flags, 16).ok()?,
        })
    }
}

fn random_hex(len: usize) -> String {
    let mut out = Uuid::new_v4().simple().to_string();
    while out.len() < len {
        out.push_str(&Uuid::new_v4().simple().to_string());
    }
    out.truncate(len);
    out
}

fn is_lower_hex(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(text: &str) -> bool {
    text.chars().all(|c| c == '0')
}
