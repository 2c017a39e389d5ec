//! End-to-end session recording flow
//!
//! Exercises the full pipeline: typed appends through the facade,
//! durable frames on disk, history replay to a late subscriber, live
//! fan-out afterward, image lookup, transcript output, and the
//! cross-process lock.

use sessionbook::hub::HubConfig;
use sessionbook::journal::Journal;
use sessionbook::record::{Identity, RecordKind};
use sessionbook::render;
use sessionbook::session::Session;
use tempfile::TempDir;

fn identity() -> Identity {
    Identity::new("tester", "testhost")
}

/// Surface journal/hub logs under `--nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Test 1: command then console are journaled with seqnos 0 and 1, a
/// late subscriber replays init then both in order, a subsequent image
/// arrives live as seqno 2, and the image is indexed for lookup.
#[tokio::test]
async fn test_record_replay_then_live_delivery() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("session.book");
    let session = Session::open(&identity(), &path, HubConfig::default()).unwrap();

    let cmd = session.record_command("x<-1").unwrap();
    assert_eq!(cmd.sequence, 0);
    assert_eq!(cmd.rendered, "32:{\"seqno\": 0, \"command\":[\"x<-1\"]}");

    let out = session.record_console(&["[1] 1".to_string()]).unwrap();
    assert_eq!(out.sequence, 1);

    let mut sub = session.subscribe().await.unwrap();
    let init = sub.recv().await.unwrap();
    assert!(init.contains("\"init\":true"));
    assert!(init.contains(&session.journal().header().session_id));
    assert_eq!(sub.recv().await.unwrap(), cmd.rendered);
    assert_eq!(sub.recv().await.unwrap(), out.rendered);

    let img = session.record_image("/plots/a.png", vec![1, 2, 3]).unwrap();
    assert_eq!(img.sequence, 2);
    assert_eq!(sub.recv().await.unwrap(), img.rendered);

    let found = session.journal().lookup_image("/plots/a.png").unwrap();
    assert_eq!(found, img);
    assert_eq!(
        found.image_path_hash,
        render::path_hash("testhost", "/plots/a.png", &[1, 2, 3])
    );
}

/// Test 2: every appended record survives the disk round trip: a
/// reopened journal replays the same records, keeps the original
/// session identity, and resumes numbering where it left off.
#[tokio::test]
async fn test_reopen_preserves_records_and_resumes_numbering() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("session.book");
    let first_header;
    {
        let session = Session::open(&identity(), &path, HubConfig::default()).unwrap();
        first_header = session.journal().header();
        session.record_command("a <- 1").unwrap();
        session.record_comment("note to self").unwrap();
        session.sync().unwrap();
    }

    let journal = Journal::open(&identity(), &path).unwrap();
    assert_eq!(journal.header(), first_header);
    let records = journal.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].kind, RecordKind::Command);
    assert_eq!(records[1].kind, RecordKind::Comment);

    let next = journal.append_command("b <- 2").unwrap();
    assert_eq!(next.sequence, 2);
}

/// Test 3: two subscribers joining at different times both observe the
/// same gapless, ordered stream.
#[tokio::test]
async fn test_two_subscribers_consistent_order() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let session = Session::open(
        &identity(),
        tmp.path().join("session.book"),
        HubConfig::default(),
    )
    .unwrap();

    let r0 = session.record_command("x <- 1").unwrap();
    let r1 = session.record_console(&["[1] 1".to_string()]).unwrap();

    let mut early = session.subscribe().await.unwrap();
    early.recv().await.unwrap(); // init
    assert_eq!(early.recv().await.unwrap(), r0.rendered);
    assert_eq!(early.recv().await.unwrap(), r1.rendered);

    let r2 = session.record_comment("checkpoint").unwrap();
    assert_eq!(early.recv().await.unwrap(), r2.rendered);

    // A viewer joining after seqno 2 replays everything as history.
    let mut late = session.subscribe().await.unwrap();
    late.recv().await.unwrap(); // init
    assert_eq!(late.recv().await.unwrap(), r0.rendered);
    assert_eq!(late.recv().await.unwrap(), r1.rendered);
    assert_eq!(late.recv().await.unwrap(), r2.rendered);
}

/// Test 4: the transcript sidecar mirrors the session in plain text.
#[tokio::test]
async fn test_transcript_sidecar_content() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("session.book");
    let session = Session::open(&identity(), &path, HubConfig::default()).unwrap();

    session.record_command("x <- 1").unwrap();
    session.record_console(&["[1] 1".to_string()]).unwrap();
    session.record_comment("done").unwrap();
    session.record_image("/plots/a.png", vec![9]).unwrap();

    let text = std::fs::read_to_string(format!("{}.script", path.display())).unwrap();
    assert_eq!(
        text,
        "x <- 1\n    ## [1] 1\n### done\n    ## saved image: /plots/a.png\n"
    );
}

/// Test 5: the lock excludes a second recorder while held and admits
/// one after release.
#[cfg(unix)]
#[tokio::test]
async fn test_lock_guards_session_journal() {
    use sessionbook::lock::{LockError, UnixSocketLock};

    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("session.book");

    let lock = UnixSocketLock::acquire(&path).await.unwrap();
    let session = Session::open(&identity(), &path, HubConfig::default()).unwrap();
    session.record_command("x <- 1").unwrap();

    let second = UnixSocketLock::acquire(&path).await;
    assert!(matches!(second, Err(LockError::Held { .. })));

    lock.release().await;
    let reacquired = UnixSocketLock::acquire(&path).await.unwrap();
    reacquired.release().await;
}
