//! Append-only journal store with self-healing
//!
//! One file per recorded session: a session header frame followed by
//! event record frames (see `codec`). The journal keeps a complete
//! in-memory mirror of the file plus an image-path index, guarded by
//! one mutex held only across in-memory mutation, never across file
//! I/O or queue sends.
//!
//! The append path defends against external interference with the
//! backing file (editors, sync daemons, overzealous cleanup scripts):
//! - file shrunk or vanished → rewrite the whole file from memory;
//! - write flushed but the file did not grow → re-read and recount;
//!   exactly one record short means only the newest append was lost,
//!   so retry it; anything else falls back to a full rewrite.
//!
//! A torn trailing frame on open (crash mid-append) is dropped and
//! truncated away, never surfaced as an error. A corrupt frame
//! anywhere else is fatal.

use crate::codec::{self, CodecError};
use crate::record::{now_nanos, EventRecord, Identity, RecordKind, SessionHeader};
use crate::render;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("journal has no complete header frame: {0}")]
    HeaderMissing(String),
}

// ── In-memory state ─────────────────────────────────────────────────

#[derive(Debug)]
struct BookState {
    header: SessionHeader,
    records: Vec<EventRecord>,
    /// image path → index into `records`.
    image_index: HashMap<String, usize>,
}

#[derive(Debug)]
struct AppendFile {
    writer: BufWriter<File>,
    /// File size we believe the journal has after our last write.
    expected_size: u64,
}

// ── Journal ─────────────────────────────────────────────────────────

/// The durable, ordered record of one session.
///
/// Safe to share behind an `Arc`: appends serialize on the file handle
/// lock, reads take only the short-lived state lock.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    state: Mutex<BookState>,
    file: Mutex<AppendFile>,
}

impl Journal {
    /// Open a journal at `path`.
    ///
    /// Absent or zero-length file: a fresh session header (timestamp +
    /// random id) is synthesized and persisted immediately. Otherwise
    /// the header frame is decoded and every record frame replayed
    /// into memory; a torn final frame is dropped and truncated away.
    pub fn open(identity: &Identity, path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let existing_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let (header, records) = if existing_len == 0 {
            let header = SessionHeader::new(identity, &path.display().to_string());
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&codec::encode_header(&header))?;
            file.sync_all()?;
            info!(
                path = %path.display(),
                session_id = %header.session_id,
                "Created fresh journal"
            );
            (header, Vec::new())
        } else {
            let data = fs::read(&path)?;
            let (header, header_len) = codec::decode_header(&data).map_err(|e| {
                if e.is_need_more() {
                    JournalError::HeaderMissing(format!(
                        "file is {} bytes, shorter than its header frame",
                        data.len()
                    ))
                } else {
                    JournalError::Codec(e)
                }
            })?;

            let mut records = Vec::new();
            let mut pos = header_len;
            loop {
                match codec::decode_record(&data[pos..]) {
                    Ok((record, n)) => {
                        pos += n;
                        records.push(record);
                    }
                    Err(e) if e.is_need_more() => break,
                    Err(e) => return Err(e.into()),
                }
            }

            if pos < data.len() {
                warn!(
                    path = %path.display(),
                    dropped = data.len() - pos,
                    "Dropping torn trailing frame"
                );
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(pos as u64)?;
            }
            info!(
                path = %path.display(),
                records = records.len(),
                session_id = %header.session_id,
                "Journal reopened"
            );
            (header, records)
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let expected_size = file.metadata()?.len();

        let mut image_index = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            if record.kind == RecordKind::Image && !record.image_path.is_empty() {
                image_index.insert(record.image_path.clone(), i);
            }
        }

        Ok(Self {
            path,
            state: Mutex::new(BookState {
                header,
                records,
                image_index,
            }),
            file: Mutex::new(AppendFile {
                writer: BufWriter::new(file),
                expected_size,
            }),
        })
    }

    // ── Typed appends ───────────────────────────────────────────────

    /// Append a command line. Returns the stored record.
    pub fn append_command(&self, cmd: &str) -> Result<EventRecord, JournalError> {
        self.append_record(|seq| {
            let rendered = render::command_message(cmd, seq);
            EventRecord::new(RecordKind::Command, seq, now_nanos(), rendered)
        })
    }

    /// Append captured console output lines.
    pub fn append_console(&self, lines: &[String]) -> Result<EventRecord, JournalError> {
        self.append_record(|seq| {
            let rendered = render::console_message(lines, seq);
            EventRecord::new(RecordKind::Console, seq, now_nanos(), rendered)
        })
    }

    /// Append a comment.
    pub fn append_comment(&self, text: &str) -> Result<EventRecord, JournalError> {
        self.append_record(|seq| {
            let rendered = render::comment_message(text, seq);
            EventRecord::new(RecordKind::Comment, seq, now_nanos(), rendered)
        })
    }

    /// Append an image: origin host comes from the session header, the
    /// fingerprint is computed over (host, path, bytes).
    pub fn append_image(
        &self,
        image_path: &str,
        bytes: Vec<u8>,
    ) -> Result<EventRecord, JournalError> {
        let host = self.state_guard().header.host.clone();
        let hash = render::path_hash(&host, image_path, &bytes);
        self.append_record(move |seq| {
            let rendered = render::image_message(image_path, &hash, seq);
            EventRecord::new_image(
                seq,
                now_nanos(),
                rendered,
                host,
                image_path.to_string(),
                bytes,
                hash,
            )
        })
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// O(1) image lookup by on-disk path.
    pub fn lookup_image(&self, path: &str) -> Option<EventRecord> {
        let st = self.state_guard();
        st.image_index.get(path).map(|&i| st.records[i].clone())
    }

    /// Header plus every rendered payload in sequence order, cloned
    /// under the state lock. This is the hub's history view.
    pub fn snapshot(&self) -> (SessionHeader, Vec<String>) {
        let st = self.state_guard();
        let payloads = st.records.iter().map(|r| r.rendered.clone()).collect();
        (st.header.clone(), payloads)
    }

    /// The session header.
    pub fn header(&self) -> SessionHeader {
        self.state_guard().header.clone()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.state_guard().records.len()
    }

    /// True when no record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full copy of the in-memory record sequence.
    pub fn records(&self) -> Vec<EventRecord> {
        self.state_guard().records.clone()
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffers and fsync the backing file.
    pub fn sync(&self) -> Result<(), JournalError> {
        let mut fh = self.file_guard();
        fh.writer.flush()?;
        fh.writer.get_ref().sync_all()?;
        Ok(())
    }

    // ── Append internals ────────────────────────────────────────────

    fn append_record(
        &self,
        build: impl FnOnce(u64) -> EventRecord,
    ) -> Result<EventRecord, JournalError> {
        let mut fh = self.file_guard();

        // Assign the next sequence and mirror in memory. The state lock
        // is released before any disk I/O; a subscriber registering
        // between the mirror update and the publish sees this record in
        // its history snapshot.
        let record = {
            let mut st = self.state_guard();
            let seq = st.records.len() as u64;
            let record = build(seq);
            if record.kind == RecordKind::Image && !record.image_path.is_empty() {
                let idx = st.records.len();
                st.image_index.insert(record.image_path.clone(), idx);
            }
            st.records.push(record.clone());
            record
        };

        let frame = codec::encode_record(&record);
        self.write_verified(&mut fh, &frame)?;
        debug!(
            seqno = record.sequence,
            kind = record.kind.label(),
            bytes = frame.len(),
            "Appended record"
        );
        Ok(record)
    }

    /// Write one frame, then verify the file grew by exactly that much.
    fn write_verified(&self, fh: &mut AppendFile, frame: &[u8]) -> Result<(), JournalError> {
        fh.writer.write_all(frame)?;
        fh.writer.flush()?;

        let grown = fh.expected_size + frame.len() as u64;
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() == grown => {
                fh.expected_size = grown;
                Ok(())
            }
            Ok(meta) if meta.len() == fh.expected_size => {
                warn!(
                    path = %self.path.display(),
                    size = meta.len(),
                    "Append flushed but the file did not grow; recounting"
                );
                self.retry_or_rewrite(fh, frame)
            }
            Ok(meta) => {
                warn!(
                    path = %self.path.display(),
                    observed = meta.len(),
                    expected = grown,
                    "Journal shrunk or replaced externally; rewriting from memory"
                );
                self.rewrite_all(fh)
            }
            Err(_) => {
                warn!(
                    path = %self.path.display(),
                    "Journal file vanished; rewriting from memory"
                );
                self.rewrite_all(fh)
            }
        }
    }

    /// The size-didn't-grow case. Best effort: an on-disk count exactly
    /// one short of memory is read as "only the newest append was
    /// lost", and that one write is retried. Any other count means we
    /// no longer know what the file contains, so rewrite it.
    fn retry_or_rewrite(&self, fh: &mut AppendFile, frame: &[u8]) -> Result<(), JournalError> {
        let on_disk = self.count_disk_records();
        let in_memory = self.state_guard().records.len();

        if on_disk + 1 != in_memory {
            warn!(
                on_disk,
                in_memory, "On-disk count diverged by more than one; rewriting from memory"
            );
            return self.rewrite_all(fh);
        }

        warn!(on_disk, in_memory, "Recount confirms a single lost append; retrying");
        let file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(f) => f,
            Err(_) => return self.rewrite_all(fh),
        };
        fh.expected_size = file.metadata()?.len();
        fh.writer = BufWriter::new(file);
        fh.writer.write_all(frame)?;
        fh.writer.flush()?;

        let observed = fs::metadata(&self.path)?.len();
        if observed == fh.expected_size + frame.len() as u64 {
            fh.expected_size = observed;
            Ok(())
        } else {
            warn!("Retried append still did not stick; rewriting from memory");
            self.rewrite_all(fh)
        }
    }

    /// Tolerant count of complete record frames on disk. Anything
    /// undecodable stops the count; the caller treats a short count as
    /// divergence.
    fn count_disk_records(&self) -> usize {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let mut pos = match codec::decode_header(&data) {
            Ok((_, n)) => n,
            Err(_) => return 0,
        };
        let mut count = 0;
        while let Ok((_, n)) = codec::decode_record(&data[pos..]) {
            pos += n;
            count += 1;
        }
        count
    }

    /// Rewrite header + all records to a fresh file and swap it into
    /// place, then reopen the append handle on it. The just-appended
    /// record is already in memory, so it is included.
    fn rewrite_all(&self, fh: &mut AppendFile) -> Result<(), JournalError> {
        let (header, records) = {
            let st = self.state_guard();
            (st.header.clone(), st.records.clone())
        };

        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut f = File::create(&tmp)?;
        f.write_all(&codec::encode_header(&header))?;
        for record in &records {
            f.write_all(&codec::encode_record(record))?;
        }
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        fh.expected_size = file.metadata()?.len();
        fh.writer = BufWriter::new(file);
        info!(
            path = %self.path.display(),
            records = records.len(),
            "Journal rebuilt from memory"
        );
        Ok(())
    }

    fn state_guard(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn file_guard(&self) -> MutexGuard<'_, AppendFile> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_identity() -> Identity {
        Identity::new("tester", "testhost")
    }

    fn book_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("session.book")
    }

    /// Decode the whole file from offset 0, header plus records.
    fn decode_file(path: &Path) -> (SessionHeader, Vec<EventRecord>) {
        let data = fs::read(path).unwrap();
        let (header, mut pos) = codec::decode_header(&data).unwrap();
        let mut records = Vec::new();
        loop {
            match codec::decode_record(&data[pos..]) {
                Ok((r, n)) => {
                    pos += n;
                    records.push(r);
                }
                Err(e) => {
                    assert!(e.is_need_more(), "unexpected decode failure: {}", e);
                    break;
                }
            }
        }
        (header, records)
    }

    #[test]
    fn test_fresh_journal_persists_header() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        assert!(journal.is_empty());

        let (header, records) = decode_file(&book_path(&tmp));
        assert_eq!(header, journal.header());
        assert_eq!(header.user, "tester");
        assert!(records.is_empty());
    }

    #[test]
    fn test_empty_existing_file_treated_as_fresh() {
        let tmp = TempDir::new().unwrap();
        fs::write(book_path(&tmp), b"").unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        assert!(journal.is_empty());
        assert!(!journal.header().session_id.is_empty());
    }

    #[test]
    fn test_append_assigns_gapless_sequences() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();

        let a = journal.append_command("x <- 1").unwrap();
        let b = journal.append_console(&["[1] 1".to_string()]).unwrap();
        let c = journal.append_comment("checkpoint").unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (0, 1, 2));
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn test_roundtrip_through_disk() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        journal.append_command("x <- 1").unwrap();
        journal.append_console(&["[1] 1".to_string()]).unwrap();
        journal.append_image("/plots/a.png", vec![1, 2, 3]).unwrap();

        let (_, on_disk) = decode_file(&book_path(&tmp));
        assert_eq!(on_disk, journal.records());
    }

    #[test]
    fn test_reopen_replays_and_keeps_session_id() {
        let tmp = TempDir::new().unwrap();
        let first_header;
        {
            let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
            first_header = journal.header();
            journal.append_command("a <- 1").unwrap();
            journal.append_comment("note").unwrap();
        }

        let reopened = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        assert_eq!(reopened.header(), first_header);
        assert_eq!(reopened.len(), 2);

        // Numbering resumes at the in-memory count.
        let next = reopened.append_command("b <- 2").unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_torn_trailing_frame_dropped() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
            journal.append_command("a <- 1").unwrap();
            journal.append_command("b <- 2").unwrap();
        }

        // Tear the last frame.
        let data = fs::read(book_path(&tmp)).unwrap();
        fs::write(book_path(&tmp), &data[..data.len() - 3]).unwrap();

        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        assert_eq!(journal.len(), 1, "torn record must be dropped, not an error");

        // The tear was truncated away; appending keeps the file decodable.
        journal.append_command("c <- 3").unwrap();
        let (_, records) = decode_file(&book_path(&tmp));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 1);
    }

    #[test]
    fn test_corrupt_header_is_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(book_path(&tmp), [0x99, 0x01, 0x02, 0x03]).unwrap();
        let err = Journal::open(&test_identity(), book_path(&tmp)).unwrap_err();
        assert!(matches!(err, JournalError::Codec(_)));
    }

    #[test]
    fn test_corrupt_record_frame_is_fatal() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
            journal.append_command("ok").unwrap();
        }
        let mut data = fs::read(book_path(&tmp)).unwrap();
        data.extend_from_slice(&[0x99, 0xff, 0xff, 0xff]); // bad marker after valid frames
        fs::write(book_path(&tmp), &data).unwrap();

        let err = Journal::open(&test_identity(), book_path(&tmp)).unwrap_err();
        assert!(matches!(err, JournalError::Codec(CodecError::CorruptFrame(_))));
    }

    #[test]
    fn test_short_header_reports_header_missing() {
        let tmp = TempDir::new().unwrap();
        fs::write(book_path(&tmp), [0xc5, 0xff]).unwrap(); // bin16 frame cut short
        let err = Journal::open(&test_identity(), book_path(&tmp)).unwrap_err();
        assert!(matches!(err, JournalError::HeaderMissing(_)));
    }

    #[test]
    fn test_lookup_image() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        journal.append_command("plot(x)").unwrap();
        let appended = journal.append_image("/plots/a.png", vec![9, 9, 9]).unwrap();

        let found = journal.lookup_image("/plots/a.png").unwrap();
        assert_eq!(found, appended);
        assert_eq!(
            found.image_path_hash,
            render::path_hash("testhost", "/plots/a.png", &[9, 9, 9])
        );
        assert!(journal.lookup_image("/plots/missing.png").is_none());
    }

    #[test]
    fn test_append_survives_external_delete() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        journal.append_command("a <- 1").unwrap();
        journal.append_command("b <- 2").unwrap();

        fs::remove_file(book_path(&tmp)).unwrap();

        // The next append notices and rebuilds the whole file.
        journal.append_command("c <- 3").unwrap();
        let (header, records) = decode_file(&book_path(&tmp));
        assert_eq!(header, journal.header());
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].sequence, 2);
    }

    #[test]
    fn test_append_survives_external_truncation() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        for i in 0..4 {
            journal.append_command(&format!("cmd{}", i)).unwrap();
        }

        // Chop the file down to a prefix, as external tooling might.
        let data = fs::read(book_path(&tmp)).unwrap();
        fs::write(book_path(&tmp), &data[..data.len() / 2]).unwrap();

        journal.append_command("cmd4").unwrap();
        let (_, records) = decode_file(&book_path(&tmp));
        assert_eq!(records.len(), 5);
        assert_eq!(records, journal.records());
    }

    #[test]
    fn test_snapshot_orders_payloads() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(&test_identity(), book_path(&tmp)).unwrap();
        journal.append_command("x <- 1").unwrap();
        journal.append_console(&["[1] 1".to_string()]).unwrap();

        let (header, payloads) = journal.snapshot();
        assert_eq!(header, journal.header());
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("\"seqno\": 0"));
        assert!(payloads[1].contains("\"seqno\": 1"));
    }
}
