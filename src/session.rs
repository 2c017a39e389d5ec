//! Session facade
//!
//! One recorded session = one journal, its transcript sidecar, and one
//! replication hub. The facade owns all three and exposes the typed
//! recording calls producers use. Order inside each call: journal
//! append (authoritative, errors propagate), transcript line (best
//! effort), hub publish. Appending before publishing is what makes the
//! no-gap guarantee hold for subscribers; the worst case at the
//! history/live boundary is a duplicate, which viewers drop by seqno.
//!
//! The exclusivity lock and the WebSocket router are composed by the
//! caller around a `Session`; the facade does not own them.

use crate::hub::{Hub, HubConfig, HubHandle, Subscription};
use crate::journal::{Journal, JournalError};
use crate::record::{EventRecord, Identity};
use crate::transcript::Transcript;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Session {
    journal: Arc<Journal>,
    transcript: Transcript,
    hub: HubHandle,
}

impl Session {
    /// Open (or reopen) the journal at `path`, open the transcript
    /// sidecar next to it, and start the hub coordinator. Must run
    /// inside a tokio runtime.
    pub fn open(
        identity: &Identity,
        path: impl AsRef<Path>,
        hub_config: HubConfig,
    ) -> Result<Self, JournalError> {
        let path = path.as_ref();
        let journal = Arc::new(Journal::open(identity, path)?);
        let transcript = Transcript::for_journal(path);
        let hub = Hub::spawn(journal.clone(), hub_config);
        info!(
            path = %path.display(),
            records = journal.len(),
            "Session opened"
        );
        Ok(Self {
            journal,
            transcript,
            hub,
        })
    }

    pub fn record_command(&self, cmd: &str) -> Result<EventRecord, JournalError> {
        let record = self.journal.append_command(cmd)?;
        self.transcript.command(cmd);
        self.hub.publish(record.rendered.clone());
        Ok(record)
    }

    pub fn record_console(&self, lines: &[String]) -> Result<EventRecord, JournalError> {
        let record = self.journal.append_console(lines)?;
        self.transcript.console(lines);
        self.hub.publish(record.rendered.clone());
        Ok(record)
    }

    pub fn record_comment(&self, text: &str) -> Result<EventRecord, JournalError> {
        let record = self.journal.append_comment(text)?;
        self.transcript.comment(text);
        self.hub.publish(record.rendered.clone());
        Ok(record)
    }

    pub fn record_image(
        &self,
        image_path: &str,
        bytes: Vec<u8>,
    ) -> Result<EventRecord, JournalError> {
        let record = self.journal.append_image(image_path, bytes)?;
        self.transcript.image(image_path);
        self.hub.publish(record.rendered.clone());
        Ok(record)
    }

    /// Register a live viewer on this session's hub.
    pub async fn subscribe(&self) -> Option<Subscription> {
        self.hub.subscribe().await
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Flush and fsync the journal file.
    pub fn sync(&self) -> Result<(), JournalError> {
        self.journal.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_identity() -> Identity {
        Identity::new("tester", "testhost")
    }

    #[tokio::test]
    async fn test_record_reaches_journal_transcript_and_subscriber() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.book");
        let session = Session::open(&test_identity(), &path, HubConfig::default()).unwrap();

        let mut sub = session.subscribe().await.unwrap();
        assert!(sub.recv().await.unwrap().contains("\"init\":true"));

        let record = session.record_command("x <- 1").unwrap();
        assert_eq!(sub.recv().await.unwrap(), record.rendered);
        assert_eq!(session.journal().len(), 1);

        let transcript = fs::read_to_string(format!("{}.script", path.display())).unwrap();
        assert_eq!(transcript, "x <- 1\n");
    }

    #[tokio::test]
    async fn test_record_image_is_indexed() {
        let tmp = TempDir::new().unwrap();
        let session = Session::open(
            &test_identity(),
            tmp.path().join("session.book"),
            HubConfig::default(),
        )
        .unwrap();

        let record = session.record_image("/plots/a.png", vec![7, 7, 7]).unwrap();
        let found = session.journal().lookup_image("/plots/a.png").unwrap();
        assert_eq!(found, record);
    }
}
