//! Typed session records and the journal session header
//!
//! A journal is a sequence of [`EventRecord`]s preceded by one
//! [`SessionHeader`]. Records carry their rendered wire text (see
//! `render`) so replay never re-renders; the structured fields stay
//! authoritative and the text is memoized output.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

// ── Record Kind ─────────────────────────────────────────────────────

/// What a record captures. The numeric values are stable on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// A command line entered into the session.
    Command = 1,
    /// Console output captured from the session.
    Console = 2,
    /// A generated image (plot, screenshot).
    Image = 4,
    /// A comment typed by the user.
    Comment = 8,
}

impl RecordKind {
    /// Decode the on-disk numeric value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Command),
            2 => Some(RecordKind::Console),
            4 => Some(RecordKind::Image),
            8 => Some(RecordKind::Comment),
            _ => None,
        }
    }

    /// Lowercase label for logging and transcripts.
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Command => "command",
            RecordKind::Console => "console",
            RecordKind::Image => "image",
            RecordKind::Comment => "comment",
        }
    }
}

// ── Event Record ────────────────────────────────────────────────────

/// One immutable entry in the journal.
///
/// Exactly one logical payload is populated per record: the rendered
/// wire text always, plus the image fields when `kind` is
/// [`RecordKind::Image`] (empty otherwise).
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Payload variant.
    pub kind: RecordKind,
    /// Assigned at append time; strictly increasing within a journal.
    pub sequence: u64,
    /// Unix nanosecond timestamp at creation (wall clock).
    pub timestamp: i64,
    /// Length-prefixed wire text, produced once and replayed verbatim.
    pub rendered: String,
    /// Host the image was produced on (image records only).
    pub image_host: String,
    /// On-disk path of the image file (image records only).
    pub image_path: String,
    /// Raw image file content (image records only).
    pub image_bytes: Vec<u8>,
    /// Fingerprint over (host, path, bytes), see `render::path_hash`.
    pub image_path_hash: String,
}

impl EventRecord {
    /// Create a non-image record.
    pub fn new(kind: RecordKind, sequence: u64, timestamp: i64, rendered: String) -> Self {
        Self {
            kind,
            sequence,
            timestamp,
            rendered,
            image_host: String::new(),
            image_path: String::new(),
            image_bytes: Vec::new(),
            image_path_hash: String::new(),
        }
    }

    /// Create an image record with its origin and fingerprint fields.
    pub fn new_image(
        sequence: u64,
        timestamp: i64,
        rendered: String,
        host: String,
        path: String,
        bytes: Vec<u8>,
        path_hash: String,
    ) -> Self {
        Self {
            kind: RecordKind::Image,
            sequence,
            timestamp,
            rendered,
            image_host: host,
            image_path: path,
            image_bytes: bytes,
            image_path_hash: path_hash,
        }
    }
}

// ── Session Header ──────────────────────────────────────────────────

/// The first frame of every journal: when and where the session
/// started, and a random id so viewers never confuse two journals.
///
/// The JSON keys are the wire names used by the hub's init message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Unix nanosecond creation timestamp.
    #[serde(rename = "createTm")]
    pub created: i64,
    /// Random id, unique per journal lifetime.
    #[serde(rename = "bookID")]
    pub session_id: String,
    pub user: String,
    pub host: String,
    /// The journal path as it was opened.
    pub path: String,
}

impl SessionHeader {
    /// Synthesize a fresh header for a new journal.
    pub fn new(identity: &Identity, path: &str) -> Self {
        Self {
            created: now_nanos(),
            session_id: new_session_id(),
            user: identity.user.clone(),
            host: identity.host.clone(),
            path: path.to_string(),
        }
    }
}

/// Who is writing the journal. Supplied by the caller; the core never
/// consults the environment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user: String,
    pub host: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Current wall clock as unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Random session id (unhyphenated v4 uuid).
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}
