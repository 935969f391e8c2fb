//! W3C Trace Context propagation.
//!
//! Each inbound request carries (or is minted) a `traceparent`. The ids ride
//! on the tracing span and on every upstream call so a single tool invocation
//! can be followed across the gateway and the spreadsheet API.

use rand::RngCore;

pub const TRACEPARENT_HEADER: &str = "traceparent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
}

impl TraceContext {
    /// Mint a fresh context (no inbound header).
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            parent_span_id: None,
            sampled: true,
        }
    }

    /// Parse `traceparent: 00-<trace-id>-<parent-id>-<flags>` and mint a new
    /// span under it. Malformed or all-zero headers yield a fresh root.
    pub fn from_traceparent(header: Option<&str>) -> Self {
        let Some(raw) = header else {
            return Self::new_root();
        };
        let parts: Vec<&str> = raw.trim().split('-').collect();
        if parts.len() != 4 {
            return Self::new_root();
        }
        let (version, trace_id, parent_id, flags) = (parts[0], parts[1], parts[2], parts[3]);
        let valid = version.len() == 2
            && version != "ff"
            && is_lower_hex(trace_id, 32)
            && trace_id.bytes().any(|b| b != b'0')
            && is_lower_hex(parent_id, 16)
            && parent_id.bytes().any(|b| b != b'0')
            && is_lower_hex(flags, 2);
        if !valid {
            return Self::new_root();
        }
        Self {
            trace_id: trace_id.to_string(),
            span_id: random_hex(8),
            parent_span_id: Some(parent_id.to_string()),
            sampled: u8::from_str_radix(flags, 16).map(|f| f & 1 == 1).unwrap_or(true),
        }
    }

    /// Header value for outbound propagation.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }

    /// Child context for a sub-operation (same trace, new span).
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_traceparent() {
        let ctx = TraceContext::from_traceparent(Some(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ));
        assert_eq!(ctx.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
        assert!(ctx.sampled);
        assert_ne!(ctx.span_id, "b7ad6b7169203331");
    }

    #[test]
    fn malformed_headers_mint_fresh_ids() {
        for bad in [
            None,
            Some(""),
            Some("garbage"),
            Some("00-zzzz-b7ad6b7169203331-01"),
            Some("00-00000000000000000000000000000000-b7ad6b7169203331-01"),
            Some("ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        ] {
            let ctx = TraceContext::from_traceparent(bad);
            assert_eq!(ctx.trace_id.len(), 32);
            assert_eq!(ctx.span_id.len(), 16);
            assert!(ctx.parent_span_id.is_none());
        }
    }

    #[test]
    fn round_trips_through_header() {
        let ctx = TraceContext::new_root();
        let reparsed = TraceContext::from_traceparent(Some(&ctx.to_traceparent()));
        assert_eq!(reparsed.trace_id, ctx.trace_id);
        assert_eq!(reparsed.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
    }
}
