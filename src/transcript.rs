//! Plain-text transcript sidecar
//!
//! A human-readable companion file written next to the journal
//! (`<journal>.script`): commands land verbatim, console output and
//! saved images as indented `##` lines, user comments as `###` lines.
//! The sidecar is convenience output only; the binary journal stays
//! authoritative and the sidecar is never read back. Write failures
//! are logged and the transcript goes quiet; they never fail a
//! recording.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Suffix appended to the journal path to name the sidecar file.
pub const TRANSCRIPT_SUFFIX: &str = ".script";

pub struct Transcript {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Transcript {
    /// Open the sidecar next to `journal_path`, creating it if absent
    /// and appending if it exists. An unopenable sidecar disables the
    /// transcript rather than failing the session.
    pub fn for_journal(journal_path: &Path) -> Self {
        let path = PathBuf::from(format!("{}{}", journal_path.display(), TRANSCRIPT_SUFFIX));
        let writer = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(BufWriter::new(f)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Transcript disabled");
                None
            }
        };
        Self {
            path,
            writer: Mutex::new(writer),
        }
    }

    /// The sidecar path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Command text, verbatim, one line per source line.
    pub fn command(&self, cmd: &str) {
        self.append(&format!("{}\n", cmd.trim_end_matches('\n')));
    }

    /// Captured console lines, each as `    ## <line>`.
    pub fn console(&self, lines: &[String]) {
        let mut text = String::new();
        for line in lines {
            text.push_str("    ## ");
            text.push_str(line);
            text.push('\n');
        }
        self.append(&text);
    }

    /// Comment text, each line as `### <line>`.
    pub fn comment(&self, text: &str) {
        let mut out = String::new();
        for line in text.trim_end_matches('\n').split('\n') {
            out.push_str("### ");
            out.push_str(line);
            out.push('\n');
        }
        self.append(&out);
    }

    /// A saved-image marker line.
    pub fn image(&self, image_path: &str) {
        self.append(&format!("    ## saved image: {}\n", image_path));
    }

    fn append(&self, text: &str) {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => return,
        };
        let outcome = writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.flush());
        if let Err(e) = outcome {
            warn!(path = %self.path.display(), error = %e, "Transcript write failed; disabling");
            *guard = None;
        }
    }
}
