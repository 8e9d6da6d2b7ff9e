//! Client-side cache of the PDFs selected for the active chat.
//!
//! Local state is authoritative for the caller: every mutation updates memory
//! and the persisted copy before returning, then hands the full resulting
//! selection to the sync outbox. A failed sync never rolls local state back.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::client::{AssociationClient, ClientError, SelectionRemote};
use crate::config::ClientConfig;
use crate::local_storage::{selection_key, LocalStorage, StorageError};
use crate::sync::{Outbox, RetryPolicy, SyncJob, SyncStatus};

#[derive(Debug, Default)]
struct SelectionState {
    chat_id: Option<String>,
    selected: Vec<String>,
    /// Last version handed to the outbox (or learned from the server)
    version: u64,
    /// Bumped on every context switch; stale fetches compare against it
    epoch: u64,
}

/// Selection handle owned by the view that shows it. Dropping it stops
/// syncing; call [`SelectionCache::shutdown`] to flush pending updates first.
pub struct SelectionCache {
    state: Mutex<SelectionState>,
    storage: Arc<LocalStorage>,
    remote: Arc<dyn SelectionRemote>,
    outbox: Outbox,
}

impl SelectionCache {
    /// Starts in the global scope with whatever was persisted for it.
    pub fn new(
        storage: Arc<LocalStorage>,
        remote: Arc<dyn SelectionRemote>,
        policy: RetryPolicy,
    ) -> Self {
        let selected = storage
            .load_ids(&selection_key(None))
            .unwrap_or_else(|e| {
                log::warn!("Failed to load global PDF selection: {}", e);
                Vec::new()
            });

        Self {
            state: Mutex::new(SelectionState {
                selected,
                ..Default::default()
            }),
            outbox: Outbox::spawn(Arc::clone(&remote), policy),
            storage,
            remote,
        }
    }

    /// Local storage and HTTP client built from `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, StorageError> {
        let storage = Arc::new(LocalStorage::open(&config.storage_path)?);
        let remote = Arc::new(AssociationClient::from_config(config));
        Ok(Self::new(storage, remote, RetryPolicy::from_config(config)))
    }

    fn lock(&self) -> MutexGuard<'_, SelectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, chat_id: Option<&str>, ids: &[String]) {
        if let Err(e) = self.storage.save_ids(&selection_key(chat_id), ids) {
            log::error!("Failed to persist PDF selection: {}", e);
        }
    }

    /// Applies `change` to the selection. When it reports a change, the new
    /// selection is persisted and, inside a chat, queued for sync.
    fn mutate(&self, change: impl FnOnce(&mut Vec<String>) -> bool) {
        let mut state = self.lock();
        if !change(&mut state.selected) {
            return;
        }

        self.persist(state.chat_id.as_deref(), &state.selected);

        if let Some(chat_id) = state.chat_id.clone() {
            // The worker may have learned a newer server version since the last mutation
            state.version = state.version.max(self.outbox.known_version(&chat_id)) + 1;
            self.outbox.enqueue(SyncJob {
                chat_id,
                version: state.version,
                pdf_ids: state.selected.clone(),
            });
        }
    }

    pub fn toggle(&self, pdf_id: &str) {
        self.mutate(|selected| {
            if selected.iter().any(|id| id == pdf_id) {
                selected.retain(|id| id != pdf_id);
            } else {
                selected.push(pdf_id.to_string());
            }
            true
        });
    }

    pub fn select(&self, pdf_id: &str) {
        self.mutate(|selected| {
            if selected.iter().any(|id| id == pdf_id) {
                return false;
            }
            selected.push(pdf_id.to_string());
            true
        });
    }

    pub fn deselect(&self, pdf_id: &str) {
        self.mutate(|selected| {
            let before = selected.len();
            selected.retain(|id| id != pdf_id);
            selected.len() != before
        });
    }

    /// Replaces the selection with exactly `pdf_ids`, in the given order.
    pub fn select_all(&self, pdf_ids: Vec<String>) {
        self.mutate(|selected| {
            *selected = pdf_ids;
            true
        });
    }

    pub fn clear(&self) {
        self.mutate(|selected| {
            selected.clear();
            true
        });
    }

    pub fn is_selected(&self, pdf_id: &str) -> bool {
        self.lock().selected.iter().any(|id| id == pdf_id)
    }

    pub fn selected(&self) -> Vec<String> {
        self.lock().selected.clone()
    }

    pub fn chat_id(&self) -> Option<String> {
        self.lock().chat_id.clone()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.outbox.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.outbox.subscribe()
    }

    /// Switches the chat context.
    ///
    /// With a chat, the persisted copy for that chat is shown until the
    /// server answers, then replaced by the server's selection. If another
    /// switch happens while the fetch is in flight, its answer is dropped.
    /// Without a chat the selection is cleared.
    pub async fn set_chat(&self, chat_id: Option<String>) -> Result<(), ClientError> {
        let (chat_id, epoch) = {
            let mut state = self.lock();
            state.epoch += 1;
            state.chat_id = chat_id.clone();

            let Some(chat_id) = chat_id else {
                state.selected.clear();
                self.persist(None, &[]);
                return Ok(());
            };

            // Never below what this client already sent or saw for the chat
            state.version = self.outbox.known_version(&chat_id);

            state.selected = self
                .storage
                .load_ids(&selection_key(Some(&chat_id)))
                .unwrap_or_else(|e| {
                    log::warn!("Failed to load PDF selection for chat {}: {}", chat_id, e);
                    Vec::new()
                });
            (chat_id, state.epoch)
        };

        let remote = match self.remote.fetch(&chat_id).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Failed to fetch PDFs for chat {}: {}", chat_id, e);
                return Err(e);
            }
        };
        self.outbox.observe_version(&chat_id, remote.version);

        let mut state = self.lock();
        if state.epoch != epoch {
            log::debug!("Dropping PDF selection for chat {}; context moved on", chat_id);
            return Ok(());
        }

        state.selected = remote.pdf_ids;
        state.version = state.version.max(remote.version);
        self.persist(Some(&chat_id), &state.selected);
        Ok(())
    }

    /// Flushes queued syncs and stops the worker.
    pub async fn shutdown(self) {
        self.outbox.shutdown().await;
    }
}
