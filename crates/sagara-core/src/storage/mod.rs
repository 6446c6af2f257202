//! Storage port for durable checkpoints, per-key exclusion, and timers.
//!
//! The engine never holds its own timer: retry, step-timeout, and
//! transaction-timeout scheduling are delegated to the storage backend,
//! which invokes a registered `TimerCallback` when a timer fires. Timers
//! are at-least-once; the engine guards against double firing with state
//! checks on load.
//!
//! Uses native async fn in traits (RPITIT); implementations live in
//! sagara-infra.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sagara_types::checkpoint::Checkpoint;
use sagara_types::error::StorageError;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Storage key for a transaction's checkpoint.
pub fn checkpoint_key(model_id: &str, transaction_id: &str) -> String {
    format!("{model_id}:{transaction_id}")
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// The kind of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retry,
    StepTimeout,
    TransactionTimeout,
}

/// A request to schedule a one-shot timer.
#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub model_id: String,
    pub transaction_id: String,
    /// Target action. `None` for transaction-level timers.
    pub action: Option<String>,
    /// Absolute fire time.
    pub fire_at: DateTime<Utc>,
    /// The interval that produced `fire_at`, in seconds.
    pub interval_secs: u64,
}

/// Delivered to the timer callback when a timer fires.
#[derive(Debug, Clone)]
pub struct TimerFire {
    pub kind: TimerKind,
    pub model_id: String,
    pub transaction_id: String,
    pub action: Option<String>,
}

/// Callback invoked by the storage backend when a timer fires.
pub type TimerCallback = Arc<dyn Fn(TimerFire) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Options for archiving a terminal flow instead of deleting it.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// How long the archived checkpoint should be retained, in seconds.
    pub retention_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// FlowStorage
// ---------------------------------------------------------------------------

/// Durable key/value storage for checkpoints plus timer scheduling hooks.
///
/// Implementations must provide per-key mutual exclusion during the
/// load/mutate/save sequences used by external completion: `acquire_lock`
/// blocks until the key's lock is free, and `release_lock` frees it.
pub trait FlowStorage: Send + Sync {
    /// Load a checkpoint. Returns `None` when the key does not exist or its
    /// TTL has elapsed.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, StorageError>> + Send;

    /// List all live checkpoints with their keys.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(String, Checkpoint)>, StorageError>> + Send;

    /// Persist a checkpoint, optionally expiring after `ttl_secs`.
    fn save(
        &self,
        key: &str,
        checkpoint: &Checkpoint,
        ttl_secs: Option<u64>,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Remove a checkpoint. No-op when absent.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Move a terminal checkpoint out of the live set, retaining it per
    /// `options`.
    fn archive(
        &self,
        key: &str,
        options: &ArchiveOptions,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Acquire the mutual-exclusion lock for a key, blocking until free.
    fn acquire_lock(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Release a previously acquired lock.
    fn release_lock(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Schedule a retry timer for a step.
    fn schedule_retry(
        &self,
        request: TimerRequest,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Cancel a pending retry timer. Firing after clear is a no-op.
    fn clear_retry(
        &self,
        model_id: &str,
        transaction_id: &str,
        action: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Schedule a per-dispatch timeout for a step.
    fn schedule_step_timeout(
        &self,
        request: TimerRequest,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Cancel a pending step timeout.
    fn clear_step_timeout(
        &self,
        model_id: &str,
        transaction_id: &str,
        action: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Schedule a transaction-wide timeout.
    fn schedule_transaction_timeout(
        &self,
        request: TimerRequest,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Cancel a pending transaction timeout.
    fn clear_transaction_timeout(
        &self,
        model_id: &str,
        transaction_id: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_key_format() {
        assert_eq!(checkpoint_key("orders", "tx-1"), "orders:tx-1");
    }
}
