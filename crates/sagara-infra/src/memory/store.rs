//! In-memory implementation of the `FlowStorage` port.
//!
//! Checkpoints are stored in their encoded JSON form and decoded on read,
//! exercising the same codec path a durable backend would. Timers are
//! tokio tasks parked on `sleep`, each holding a `CancellationToken` so a
//! `clear_*` call cancels the pending firing. Per-key mutual exclusion uses
//! one tokio `Mutex` per key; the owned guard is parked in a map until
//! `release_lock` drops it.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sagara_core::engine::checkpoint::{decode, encode};
use sagara_core::storage::{
    ArchiveOptions, FlowStorage, TimerCallback, TimerFire, TimerKind, TimerRequest,
};
use sagara_types::checkpoint::Checkpoint;
use sagara_types::error::StorageError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Stored entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

// ---------------------------------------------------------------------------
// MemoryFlowStorage
// ---------------------------------------------------------------------------

/// In-memory checkpoint store with timers and per-key locks.
///
/// Cloning shares the underlying maps, so a clone handed to the engine and
/// one kept by the host observe the same state.
#[derive(Clone, Default)]
pub struct MemoryFlowStorage {
    entries: Arc<DashMap<String, StoredEntry>>,
    archived: Arc<DashMap<String, StoredEntry>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    held: Arc<DashMap<String, OwnedMutexGuard<()>>>,
    timers: Arc<DashMap<String, CancellationToken>>,
    callback: Arc<RwLock<Option<TimerCallback>>>,
}

impl MemoryFlowStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback invoked when a timer fires.
    ///
    /// Wire this to `Orchestrator::timer_callback` so firings route back
    /// into the engine.
    pub fn set_timer_callback(&self, callback: TimerCallback) {
        let mut slot = self.callback.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    /// Number of live (non-archived) checkpoints.
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of archived checkpoints.
    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn timer_key(kind: TimerKind, model_id: &str, transaction_id: &str, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{kind:?}:{model_id}:{transaction_id}:{action}"),
            None => format!("{kind:?}:{model_id}:{transaction_id}"),
        }
    }

    fn schedule(&self, kind: TimerKind, request: TimerRequest) {
        let key = Self::timer_key(
            kind,
            &request.model_id,
            &request.transaction_id,
            request.action.as_deref(),
        );
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.insert(key.clone(), token.clone()) {
            previous.cancel();
        }

        let callback = {
            let slot = self.callback.read().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        let timers = Arc::clone(&self.timers);
        let fire = TimerFire {
            kind,
            model_id: request.model_id,
            transaction_id: request.transaction_id,
            action: request.action,
        };
        let delay = (request.fire_at - Utc::now()).to_std().unwrap_or_default();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    timers.remove(&key);
                    tracing::debug!(
                        kind = ?fire.kind,
                        transaction = fire.transaction_id.as_str(),
                        "timer fired"
                    );
                    if let Some(callback) = callback {
                        callback(fire).await;
                    }
                }
            }
        });
    }

    fn clear(&self, kind: TimerKind, model_id: &str, transaction_id: &str, action: Option<&str>) {
        let key = Self::timer_key(kind, model_id, transaction_id, action);
        if let Some((_, token)) = self.timers.remove(&key) {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for MemoryFlowStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFlowStorage")
            .field("live", &self.entries.len())
            .field("archived", &self.archived.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FlowStorage implementation
// ---------------------------------------------------------------------------

impl FlowStorage for MemoryFlowStorage {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StorageError> {
        let value = match self.entries.get(key) {
            Some(entry) if entry.expired(Utc::now()) => {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            Some(entry) => entry.value.clone(),
            None => return Ok(None),
        };
        let checkpoint =
            decode(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    async fn list(&self) -> Result<Vec<(String, Checkpoint)>, StorageError> {
        let now = Utc::now();
        let mut result = Vec::new();
        for entry in self.entries.iter() {
            if entry.expired(now) {
                continue;
            }
            let checkpoint = decode(entry.value.clone())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            result.push((entry.key().clone(), checkpoint));
        }
        Ok(result)
    }

    async fn save(
        &self,
        key: &str,
        checkpoint: &Checkpoint,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let value = encode(checkpoint).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let expires_at = ttl_secs.map(|ttl| Utc::now() + chrono::Duration::seconds(ttl as i64));
        self.entries
            .insert(key.to_string(), StoredEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn archive(&self, key: &str, options: &ArchiveOptions) -> Result<(), StorageError> {
        let Some((_, mut entry)) = self.entries.remove(key) else {
            return Ok(());
        };
        entry.expires_at = options
            .retention_secs
            .map(|retention| Utc::now() + chrono::Duration::seconds(retention as i64));
        self.archived.insert(key.to_string(), entry);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str) -> Result<(), StorageError> {
        let mutex = {
            let entry = self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        let guard = mutex.lock_owned().await;
        self.held.insert(key.to_string(), guard);
        Ok(())
    }

    async fn release_lock(&self, key: &str) -> Result<(), StorageError> {
        match self.held.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::LockNotHeld(key.to_string())),
        }
    }

    async fn schedule_retry(&self, request: TimerRequest) -> Result<(), StorageError> {
        self.schedule(TimerKind::Retry, request);
        Ok(())
    }

    async fn clear_retry(
        &self,
        model_id: &str,
        transaction_id: &str,
        action: &str,
    ) -> Result<(), StorageError> {
        self.clear(TimerKind::Retry, model_id, transaction_id, Some(action));
        Ok(())
    }

    async fn schedule_step_timeout(&self, request: TimerRequest) -> Result<(), StorageError> {
        self.schedule(TimerKind::StepTimeout, request);
        Ok(())
    }

    async fn clear_step_timeout(
        &self,
        model_id: &str,
        transaction_id: &str,
        action: &str,
    ) -> Result<(), StorageError> {
        self.clear(TimerKind::StepTimeout, model_id, transaction_id, Some(action));
        Ok(())
    }

    async fn schedule_transaction_timeout(&self, request: TimerRequest) -> Result<(), StorageError> {
        self.schedule(TimerKind::TransactionTimeout, request);
        Ok(())
    }

    async fn clear_transaction_timeout(
        &self,
        model_id: &str,
        transaction_id: &str,
    ) -> Result<(), StorageError> {
        self.clear(TimerKind::TransactionTimeout, model_id, transaction_id, None);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
