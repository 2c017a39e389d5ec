//! Replication hub
//!
//! Fan-out of rendered wire payloads to live viewers. One coordinator
//! task owns the subscriber registry and processes a multiplexed
//! command stream (register / unregister / publish), so the registry
//! needs no shared-state locking and commands interleave atomically: a
//! viewer registering after record N and before record N+1 receives
//! init, records 0..=N as history, then N+1 live. The boundary case
//! is a duplicate delivery, never a gap; viewers drop non-increasing
//! seqnos.
//!
//! Per-subscriber queues are bounded. History pushes get a long
//! deadline (bulk replay to a distant viewer legitimately takes a
//! while); live pushes get a short one. A push that misses its
//! deadline evicts that subscriber alone; the rest keep receiving.

use crate::journal::Journal;
use crate::render;
use futures::future;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

// ── Configuration ───────────────────────────────────────────────────

/// Tuning for subscriber queues and delivery deadlines.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded depth of each subscriber's delivery queue.
    pub queue_capacity: usize,
    /// Per-push deadline while replaying history to a new subscriber.
    pub history_send_timeout: Duration,
    /// Per-push deadline for live deliveries.
    pub live_send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            history_send_timeout: Duration::from_secs(300),
            live_send_timeout: Duration::from_secs(10),
        }
    }
}

// ── Handle and subscription ─────────────────────────────────────────

enum HubCommand {
    Register { reply: oneshot::Sender<Subscription> },
    Unregister { id: u64 },
    Publish { payload: String },
}

/// One registered viewer's receiving end.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next payload in delivery order; `None` once this subscriber has
    /// been evicted or unregistered and its queue is drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Register a new subscriber. Resolves as soon as the coordinator
    /// has accepted the registration; the init message and history
    /// replay arrive on the returned subscription's queue. `None` if
    /// the coordinator is gone.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Register { reply }).ok()?;
        rx.await.ok()
    }

    /// Remove a subscriber. Safe to call for an id already evicted.
    pub fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { id });
    }

    /// Queue a payload for delivery to every current subscriber.
    /// Callable from synchronous code; never blocks.
    pub fn publish(&self, payload: String) {
        if self.tx.send(HubCommand::Publish { payload }).is_err() {
            debug!("Publish dropped; hub coordinator is gone");
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct Hub;

impl Hub {
    /// Start the coordinator task. The journal supplies the snapshot
    /// (header + rendered payloads) replayed to each new subscriber.
    pub fn spawn(journal: Arc<Journal>, config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(coordinator(journal, config, rx));
        HubHandle { tx }
    }
}

async fn coordinator(
    journal: Arc<Journal>,
    config: HubConfig,
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
) {
    let mut subscribers: BTreeMap<u64, mpsc::Sender<String>> = BTreeMap::new();
    let mut next_id: u64 = 1;

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register { reply } => {
                let id = next_id;
                next_id += 1;
                let (tx, receiver) = mpsc::channel(config.queue_capacity);

                // Hand the receiver over before replaying, so the
                // subscriber drains while we fill.
                if reply.send(Subscription { id, receiver }).is_err() {
                    debug!(id, "Subscriber vanished before registration completed");
                    continue;
                }

                // Snapshot under the journal's state lock; push
                // outside it. Atomicity against publishes comes from
                // this task processing one command at a time.
                let (header, history) = journal.snapshot();
                let mut live =
                    deliver(&tx, render::init_message(&header), config.history_send_timeout).await;
                if live {
                    for payload in history {
                        if !deliver(&tx, payload, config.history_send_timeout).await {
                            live = false;
                            break;
                        }
                    }
                }

                if live {
                    subscribers.insert(id, tx);
                    info!(id, subscribers = subscribers.len(), "Subscriber registered");
                } else {
                    warn!(id, "Evicting subscriber during history replay");
                }
            }
            HubCommand::Unregister { id } => {
                if subscribers.remove(&id).is_some() {
                    info!(id, subscribers = subscribers.len(), "Subscriber unregistered");
                }
            }
            HubCommand::Publish { payload } => {
                if subscribers.is_empty() {
                    continue;
                }
                let pushes = subscribers.iter().map(|(&id, tx)| {
                    let payload = payload.clone();
                    let deadline = config.live_send_timeout;
                    async move { (id, deliver(tx, payload, deadline).await) }
                });
                // Bind first: the pushes borrow the registry, eviction
                // mutates it.
                let outcomes = future::join_all(pushes).await;
                for (id, delivered) in outcomes {
                    if !delivered {
                        subscribers.remove(&id);
                        warn!(
                            id,
                            subscribers = subscribers.len(),
                            "Evicting slow subscriber"
                        );
                    }
                }
            }
        }
    }
    debug!("Hub coordinator stopped");
}

/// Push with a deadline. False means the subscriber must go: its queue
/// stayed full past the deadline, or it already hung up.
async fn deliver(tx: &mpsc::Sender<String>, payload: String, deadline: Duration) -> bool {
    match tx.send_timeout(payload, deadline).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => false,
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
