//! Cross-process exclusivity lock
//!
//! Two cooperating recorder processes must never write one journal.
//! The rendezvous is a Unix-domain socket derived from the journal
//! path: whoever binds it holds the lock. Inbound connections get a
//! greeting naming the holder, so a losing process can report who owns
//! the journal; a leftover socket file with nobody listening behind it
//! is stale and silently reclaimed.
//!
//! Release is a handshake, not just a close: connect to self, read the
//! greeting, send the `shutdown` token, wait for the acceptor task to
//! finish, remove the socket file. Any peer may send the token; that
//! is how an operator asks a running recorder to let go of a journal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Suffix appended to the journal path to form the rendezvous address.
pub const LOCK_SUFFIX: &str = ".lock";

/// Token a peer sends to ask the holder to release.
pub const SHUTDOWN_TOKEN: &[u8; 8] = b"shutdown";

// sun_path is 108 bytes on Linux and less on some platforms; stay
// comfortably under it.
const MAX_SOCKET_PATH: usize = 100;

// ── Configuration and errors ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Deadline for each step of the stale probe (connect, greeting
    /// read).
    pub probe_timeout: Duration,
    /// Deadline for the holder-side greeting write and token read, and
    /// for the release-handshake connect.
    pub handshake_timeout: Duration,
    /// Deadline for the greeting read during the release handshake.
    pub greeting_read_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            greeting_read_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("path '{path}' has a live lock already: '{holder}'")]
    Held { path: String, holder: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Address derivation ──────────────────────────────────────────────

/// Rendezvous address for a journal: the journal path plus
/// [`LOCK_SUFFIX`], kept next to the journal. Socket paths are tightly
/// bounded, so an address that would blow the limit falls back to the
/// bare file name resolved in the working directory, the shortest
/// address available.
pub fn rendezvous_path(journal_path: &Path) -> PathBuf {
    let base = journal_path.display().to_string();
    let full = if base.ends_with(LOCK_SUFFIX) {
        PathBuf::from(base)
    } else {
        PathBuf::from(format!("{}{}", base, LOCK_SUFFIX))
    };
    if full.as_os_str().len() <= MAX_SOCKET_PATH {
        return full;
    }
    match full.file_name() {
        Some(name) => PathBuf::from(name),
        None => full,
    }
}

// ── Lock ────────────────────────────────────────────────────────────

/// Holder side of the lock: a bound listener plus its acceptor task.
#[derive(Debug)]
pub struct UnixSocketLock {
    sock_path: PathBuf,
    config: LockConfig,
    shutdown_tx: mpsc::Sender<()>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl UnixSocketLock {
    /// Acquire the lock for `journal_path` with default deadlines.
    pub async fn acquire(journal_path: impl AsRef<Path>) -> Result<Self, LockError> {
        Self::acquire_with(journal_path, LockConfig::default()).await
    }

    pub async fn acquire_with(
        journal_path: impl AsRef<Path>,
        config: LockConfig,
    ) -> Result<Self, LockError> {
        let sock_path = rendezvous_path(journal_path.as_ref());

        if sock_path.exists() {
            match probe_holder(&sock_path, &config).await {
                Probe::Held(holder) => {
                    return Err(LockError::Held {
                        path: sock_path.display().to_string(),
                        holder,
                    });
                }
                Probe::Stale(reason) => {
                    info!(
                        socket = %sock_path.display(),
                        reason,
                        "Removing stale lock socket"
                    );
                    match fs::remove_file(&sock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let listener = UnixListener::bind(&sock_path)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let acceptor = tokio::spawn(accept_loop(
            listener,
            sock_path.clone(),
            config.clone(),
            shutdown_rx,
            shutdown_tx.clone(),
        ));
        info!(socket = %sock_path.display(), "Lock acquired");
        Ok(Self {
            sock_path,
            config,
            shutdown_tx,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// The bound rendezvous address.
    pub fn socket_path(&self) -> &Path {
        &self.sock_path
    }

    /// Release the lock. Performs the shutdown handshake against our
    /// own acceptor, waits for it to finish, and removes the socket
    /// file. Idempotent: calling again (or after a peer already shut
    /// the acceptor down) only re-removes the address.
    pub async fn release(&self) {
        let handle = {
            let mut guard = self.acceptor.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let handle = match handle {
            Some(h) => h,
            None => {
                let _ = fs::remove_file(&self.sock_path);
                return;
            }
        };

        if let Err(e) = shutdown_handshake(&self.sock_path, &self.config).await {
            // Acceptor may already be gone (peer-initiated shutdown);
            // nudge it directly in case it is still running.
            debug!(error = %e, "Release handshake failed; signaling acceptor directly");
            let _ = self.shutdown_tx.try_send(());
        }
        let _ = handle.await;
        let _ = fs::remove_file(&self.sock_path);
        info!(socket = %self.sock_path.display(), "Lock released");
    }
}

impl Drop for UnixSocketLock {
    fn drop(&mut self) {
        // Best effort for a lock dropped without release(): the
        // acceptor cleans up the socket file as it exits.
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Ask whichever process holds the lock on `journal_path` to release
/// it: connect, read the greeting, send the shutdown token.
pub async fn request_shutdown(
    journal_path: impl AsRef<Path>,
    config: &LockConfig,
) -> Result<(), LockError> {
    let sock_path = rendezvous_path(journal_path.as_ref());
    shutdown_handshake(&sock_path, config).await?;
    Ok(())
}

// ── Probe and handshake ─────────────────────────────────────────────

enum Probe {
    Held(String),
    Stale(&'static str),
}

/// Decide whether an existing rendezvous address is live. A timely
/// greeting (or any non-timeout read outcome, including EOF) means a
/// process is there; only a refused connect or a silent connection is
/// read as stale.
async fn probe_holder(sock_path: &Path, config: &LockConfig) -> Probe {
    let mut stream = match timeout(config.probe_timeout, UnixStream::connect(sock_path)).await {
        Ok(Ok(s)) => s,
        Ok(Err(_)) => return Probe::Stale("connect refused"),
        Err(_) => return Probe::Stale("connect timed out"),
    };
    let mut buf = [0u8; 4096];
    match timeout(config.probe_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => Probe::Held(String::from_utf8_lossy(&buf[..n]).into_owned()),
        Ok(Err(_)) => Probe::Held(String::new()),
        Err(_) => Probe::Stale("no greeting before deadline"),
    }
}

async fn shutdown_handshake(sock_path: &Path, config: &LockConfig) -> io::Result<()> {
    let mut stream = timeout(config.handshake_timeout, UnixStream::connect(sock_path))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    // The greeting is advisory during shutdown; don't fail on it.
    let mut buf = [0u8; 4096];
    let _ = timeout(config.greeting_read_timeout, stream.read(&mut buf)).await;
    stream.write_all(SHUTDOWN_TOKEN).await?;
    Ok(())
}

// ── Acceptor ────────────────────────────────────────────────────────

async fn accept_loop(
    listener: UnixListener,
    sock_path: PathBuf,
    config: LockConfig,
    mut shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(greet_peer(
                        stream,
                        sock_path.clone(),
                        config.clone(),
                        shutdown_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Lock socket accept failed");
                    break;
                }
            },
        }
    }
    // Dropping the listener does not unlink its socket file.
    drop(listener);
    if let Err(e) = fs::remove_file(&sock_path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(error = %e, "Could not remove lock socket file");
        }
    }
    debug!(socket = %sock_path.display(), "Lock acceptor stopped");
}

/// Serve one inbound connection: greeting out, then wait briefly for a
/// shutdown token. Probes hang up after the greeting; the read just
/// times out for them.
async fn greet_peer(
    mut stream: UnixStream,
    sock_path: PathBuf,
    config: LockConfig,
    shutdown_tx: mpsc::Sender<()>,
) {
    let greeting = format!("'{}' locked! by pid:{}", sock_path.display(), std::process::id());
    let wrote = timeout(config.handshake_timeout, stream.write_all(greeting.as_bytes())).await;
    if !matches!(wrote, Ok(Ok(()))) {
        return;
    }

    let mut buf = [0u8; 8];
    if let Ok(Ok(_)) = timeout(config.handshake_timeout, stream.read_exact(&mut buf)).await {
        if buf == *SHUTDOWN_TOKEN {
            info!(socket = %sock_path.display(), "Shutdown token received");
            let _ = shutdown_tx.send(()).await;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
