//! Outbox that ships replace-all selection updates to the association service.
//!
//! Jobs are delivered one at a time by a single worker task. Jobs for the same
//! chat that queue up behind a slow delivery collapse to the newest one, and
//! every job carries a per-chat version so the server can drop anything older
//! than what it already applied. A rejected job is re-sent above the version
//! the server reported, so the newest local selection always lands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::{ClientError, SelectionRemote};
use crate::config::ClientConfig;

/// Re-sends allowed per job after the server reports a newer version.
const MAX_REBASES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub chat_id: String,
    pub version: u64,
    pub pdf_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Pending {
        chat_id: String,
        version: u64,
    },
    Synced {
        chat_id: String,
        version: u64,
    },
    /// The server kept moving ahead of every re-send; nothing was written.
    Superseded {
        chat_id: String,
        version: u64,
    },
    Failed {
        chat_id: String,
        version: u64,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_sync_attempts,
            backoff: config.retry_backoff(),
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Highest version each chat is known to hold on the server.
#[derive(Debug, Clone, Default)]
struct KnownVersions(Arc<Mutex<HashMap<String, u64>>>);

impl KnownVersions {
    fn get(&self, chat_id: &str) -> u64 {
        let versions = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        versions.get(chat_id).copied().unwrap_or(0)
    }

    fn observe(&self, chat_id: &str, version: u64) {
        let mut versions = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let known = versions.entry(chat_id.to_string()).or_insert(0);
        *known = (*known).max(version);
    }
}

pub struct Outbox {
    tx: mpsc::UnboundedSender<SyncJob>,
    status: Arc<watch::Sender<SyncStatus>>,
    known: KnownVersions,
    worker: JoinHandle<()>,
}

impl Outbox {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(remote: Arc<dyn SelectionRemote>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus::Idle);
        let status = Arc::new(status);
        let known = KnownVersions::default();
        let worker = tokio::spawn(run(rx, remote, policy, Arc::clone(&status), known.clone()));
        Self {
            tx,
            status,
            known,
            worker,
        }
    }

    /// Highest version the server has reported for `chat_id`, 0 if none yet.
    pub fn known_version(&self, chat_id: &str) -> u64 {
        self.known.get(chat_id)
    }

    /// Records a version read from the server outside the outbox.
    pub fn observe_version(&self, chat_id: &str, version: u64) {
        self.known.observe(chat_id, version);
    }

    pub fn enqueue(&self, job: SyncJob) {
        self.status.send_replace(SyncStatus::Pending {
            chat_id: job.chat_id.clone(),
            version: job.version,
        });
        if self.tx.send(job).is_err() {
            log::error!("Selection sync worker has stopped; dropping update");
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Delivers everything already queued, then stops the worker.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            log::error!("Selection sync worker panicked: {}", e);
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<SyncJob>,
    remote: Arc<dyn SelectionRemote>,
    policy: RetryPolicy,
    status: Arc<watch::Sender<SyncStatus>>,
    known: KnownVersions,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(job) = rx.try_recv() {
            batch.push(job);
        }

        for job in coalesce(batch) {
            let outcome = deliver(remote.as_ref(), &policy, &known, job).await;
            status.send_replace(outcome);
        }
    }
    log::debug!("Selection sync worker stopped");
}

/// Keeps only the newest job per chat.
fn coalesce(batch: Vec<SyncJob>) -> Vec<SyncJob> {
    let mut latest: Vec<SyncJob> = Vec::with_capacity(batch.len());
    for job in batch {
        match latest.iter_mut().find(|queued| queued.chat_id == job.chat_id) {
            Some(queued) if job.version >= queued.version => *queued = job,
            Some(_) => {}
            None => latest.push(job),
        }
    }
    latest
}

async fn deliver(
    remote: &dyn SelectionRemote,
    policy: &RetryPolicy,
    known: &KnownVersions,
    mut job: SyncJob,
) -> SyncStatus {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    let mut rebases = 0;

    loop {
        match remote.replace(&job.chat_id, &job.pdf_ids, job.version).await {
            Ok(ack) if ack.applied => {
                known.observe(&job.chat_id, job.version);
                log::debug!(
                    "Synced {} PDFs for chat {} at version {}",
                    job.pdf_ids.len(),
                    job.chat_id,
                    job.version
                );
                return SyncStatus::Synced {
                    chat_id: job.chat_id,
                    version: job.version,
                };
            }
            Ok(ack) => {
                known.observe(&job.chat_id, ack.version);
                if rebases >= MAX_REBASES {
                    log::warn!(
                        "Server kept a newer selection for chat {} (version {}); giving up on version {}",
                        job.chat_id,
                        ack.version,
                        job.version
                    );
                    return SyncStatus::Superseded {
                        chat_id: job.chat_id,
                        version: job.version,
                    };
                }

                rebases += 1;
                let rebased = ack.version.max(job.version).saturating_add(1);
                log::info!(
                    "Server holds version {} for chat {}; re-sending version {} as {}",
                    ack.version,
                    job.chat_id,
                    job.version,
                    rebased
                );
                job.version = rebased;
            }
            Err(e) => {
                attempt += 1;
                if attempt < max_attempts && e.is_retryable() {
                    let delay = policy.delay_after(attempt);
                    log::warn!(
                        "Failed to sync PDFs for chat {} (attempt {}/{}): {}; retrying in {:?}",
                        job.chat_id,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                log::error!(
                    "Giving up syncing PDFs for chat {} after {} attempt(s): {}",
                    job.chat_id,
                    attempt,
                    e
                );
                return SyncStatus::Failed {
                    chat_id: job.chat_id,
                    version: job.version,
                    attempts: attempt,
                    error: e.to_string(),
                };
            }
        }
    }
}
