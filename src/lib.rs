//! Session recording core
//!
//! Records an interactive session (commands, console output, saved
//! images, comments) into an append-only binary journal and
//! replicates every appended record live to WebSocket viewers. A
//! late-joining viewer receives the session header, then the full
//! history, then the live stream, with no gaps; the only boundary
//! artifact is an occasional duplicate, which viewers drop by seqno.
//!
//! # Architecture
//!
//! ```text
//! producer calls                      viewers
//! (command/console/                      ▲
//!  comment/image)                        │ GET /ws
//!       │                          ┌─────┴─────┐
//!   ┌───▼────┐   rendered payload  │    Hub    │ one coordinator task,
//!   │Session ├──────────────────►  │           │ per-viewer bounded
//!   └───┬────┘                     └─────▲─────┘ queues with eviction
//!       │                                │
//!   ┌───▼────┐   history snapshot        │
//!   │Journal ├───────────────────────────┘
//!   └───┬────┘
//!       │ frames (codec)       sidecars: transcript (.script),
//!       ▼                                lock socket (.lock)
//!  append-only file
//! ```
//!
//! One mutex guards the in-memory record mirror, held only across
//! in-memory mutation and never across I/O. The journal file has a
//! single logical writer, enforced across processes by the Unix-socket
//! lock.

pub mod codec;
pub mod hub;
pub mod journal;
#[cfg(unix)]
pub mod lock;
pub mod record;
pub mod render;
pub mod session;
pub mod transcript;
pub mod ws;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
