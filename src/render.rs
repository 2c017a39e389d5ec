//! Wire text rendering and image fingerprinting
//!
//! Every unit delivered to viewers is `<decimal byte length>:<json>`.
//! The length prefix makes the stream self-framing: the transport may
//! coalesce several units into one delivery, and receivers resplit on
//! the embedded prefixes ([`split_units`]).
//!
//! Rendering happens exactly once, at append time; the journal stores
//! the result and every replay ships the identical bytes.

use crate::record::SessionHeader;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// `{"seqno": N, "command":[<line>,...]}`, one element per source line.
pub fn command_message(cmd: &str, seqno: u64) -> String {
    let lines: Vec<&str> = cmd.split('\n').collect();
    let body = format!("{{\"seqno\": {}, \"command\":{}}}", seqno, json!(lines));
    len_prefixed(&body)
}

/// `{"seqno": N, "console":["## <line>",...]}`.
pub fn console_message(lines: &[String], seqno: u64) -> String {
    let prefixed: Vec<String> = lines.iter().map(|l| format!("## {}", l)).collect();
    let body = format!("{{\"seqno\": {}, \"console\":{}}}", seqno, json!(prefixed));
    len_prefixed(&body)
}

/// `{"seqno": N, "comment":["### <line>",...]}`.
pub fn comment_message(text: &str, seqno: u64) -> String {
    let prefixed: Vec<String> = text.split('\n').map(|l| format!("### {}", l)).collect();
    let body = format!("{{\"seqno\": {}, \"comment\":{}}}", seqno, json!(prefixed));
    len_prefixed(&body)
}

/// `{"seqno":N, "image":"<path>", "pathhash":"<hash>"}`.
pub fn image_message(path: &str, path_hash: &str, seqno: u64) -> String {
    let body = format!(
        "{{\"seqno\":{}, \"image\":{}, \"pathhash\":{}}}",
        seqno,
        Value::String(path.to_string()),
        Value::String(path_hash.to_string()),
    );
    len_prefixed(&body)
}

/// `{"init":true, "book":<header json>}`, the one-time greeting sent
/// to every new subscriber before history replay. Records are never
/// embedded in it; they follow as individual units.
pub fn init_message(header: &SessionHeader) -> String {
    let body = format!("{{\"init\":true, \"book\":{}}}", json!(header));
    len_prefixed(&body)
}

/// Fingerprint an image so viewers can tell a changed plot from an
/// unchanged one even when the path is reused: SHA-256 over
/// `host:path:bytes`, hex encoded.
pub fn path_hash(host: &str, path: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn len_prefixed(body: &str) -> String {
    format!("{}:{}", body.len(), body)
}

// ── Receiver-side helpers ───────────────────────────────────────────

/// Split a transport delivery into its logical JSON bodies.
///
/// Returns `None` if the text is not a well-formed run of
/// `<len>:<json>` units.
pub fn split_units(text: &str) -> Option<Vec<&str>> {
    let mut rest = text;
    let mut units = Vec::new();
    while !rest.is_empty() {
        let (len_str, tail) = rest.split_once(':')?;
        let len: usize = len_str.parse().ok()?;
        if tail.len() < len || !tail.is_char_boundary(len) {
            return None;
        }
        units.push(&tail[..len]);
        rest = &tail[len..];
    }
    Some(units)
}

/// A parsed wire unit, as a viewer sees it. Exactly one payload group
/// is populated per unit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireEvent {
    pub seqno: Option<u64>,
    pub command: Option<Vec<String>>,
    pub console: Option<Vec<String>>,
    pub comment: Option<Vec<String>>,
    pub image: Option<String>,
    pub pathhash: Option<String>,
    pub init: Option<bool>,
}

impl WireEvent {
    /// Parse one JSON body (without the length prefix).
    pub fn parse(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }
}
