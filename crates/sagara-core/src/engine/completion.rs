//! External completion, cancellation, and timer-fire entry points.
//!
//! Async steps publish an idempotency key `<transaction>:<action>:<phase>`;
//! a separate process later calls `register_step_success` or
//! `register_step_failure` with that key to advance the flow. Every entry
//! point here serializes against concurrent callers through the storage
//! lock keyed by the checkpoint key, and runs load -> mutate -> checkpoint
//! -> release so that a given step advances at most once across a cluster.
//!
//! Timer callbacks land here too. Timers are at-least-once, so each entry
//! re-checks the step's state on load and treats a stale firing as a no-op.

use std::sync::Arc;

use sagara_types::error::StepFailure;
use sagara_types::event::FlowEvent;
use sagara_types::flow::FlowState;
use sagara_types::payload::IdempotencyKey;
use sagara_types::step::StepStatus;
use serde_json::Value;

use super::checkpoint::rehydrate;
use super::orchestrator::{Orchestrator, StepHandler, Transaction};
use super::EngineError;
use crate::storage::{FlowStorage, TimerCallback, TimerFire, TimerKind, checkpoint_key};

impl<S: FlowStorage + 'static> Orchestrator<S> {
    // -----------------------------------------------------------------------
    // External completion
    // -----------------------------------------------------------------------

    /// Complete a waiting async step successfully and continue execution.
    ///
    /// Duplicate calls for a step that already settled the key's phase are
    /// no-ops returning the current transaction. A step that is neither
    /// waiting in the key's phase nor settled fails with `IllegalState`.
    pub async fn register_step_success(
        &self,
        idempotency_key: &str,
        handler: StepHandler,
        response: Value,
    ) -> Result<Transaction, EngineError> {
        let key = parse_key(idempotency_key)?;
        let storage_key = checkpoint_key(self.model_id(), &key.transaction_id);

        self.storage().acquire_lock(&storage_key).await?;
        let result = self.complete_locked(&key, handler, Ok(response)).await;
        self.release(&storage_key, result).await
    }

    /// Fail a waiting async step and continue execution (retry or rollback
    /// per the failure rules).
    pub async fn register_step_failure(
        &self,
        idempotency_key: &str,
        error: StepFailure,
        handler: StepHandler,
    ) -> Result<Transaction, EngineError> {
        let key = parse_key(idempotency_key)?;
        let storage_key = checkpoint_key(self.model_id(), &key.transaction_id);

        self.storage().acquire_lock(&storage_key).await?;
        let result = self.complete_locked(&key, handler, Err(error)).await;
        self.release(&storage_key, result).await
    }

    async fn complete_locked(
        &self,
        key: &IdempotencyKey,
        handler: StepHandler,
        outcome: Result<Value, StepFailure>,
    ) -> Result<Transaction, EngineError> {
        let mut tx = self.load_transaction(&key.transaction_id, handler).await?;

        let step = tx
            .flow
            .step_by_action(&key.action)
            .ok_or_else(|| EngineError::UnknownAction(key.action.clone()))?;
        let exec = step.phase(key.phase);

        if exec.state.is_terminal() {
            tracing::debug!(
                transaction = key.transaction_id.as_str(),
                action = key.action.as_str(),
                phase = %key.phase,
                "duplicate external completion ignored"
            );
            return Ok(tx);
        }
        if step.active_phase() != key.phase || exec.status != StepStatus::Waiting {
            return Err(EngineError::IllegalState(format!(
                "step '{}' is not awaiting {} completion (state {:?}, status {:?})",
                key.action, key.phase, exec.state, exec.status
            )));
        }
        let step_id = step.id.clone();

        match outcome {
            Ok(response) => self.apply_success(&mut tx, &step_id, response).await?,
            Err(failure) => self.apply_failure(&mut tx, &step_id, failure).await?,
        }
        self.drive(&mut tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(&tx).await?;
        }
        Ok(tx)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cooperatively cancel a transaction.
    ///
    /// Flows that have not begun rollback are moved to rollback; in-flight
    /// handler invocations are not aborted and their results still apply.
    /// Cancelling a flow that is already compensating or terminal is a
    /// no-op.
    pub async fn cancel_transaction(&self, tx: &mut Transaction) -> Result<(), EngineError> {
        if !matches!(tx.flow.state, FlowState::NotStarted | FlowState::Invoking) {
            return Ok(());
        }
        tx.flow.cancelled_at = Some(chrono::Utc::now());
        tx.flow.state = FlowState::WaitingToCompensate;
        tracing::info!(
            transaction = tx.flow.transaction_id.as_str(),
            "transaction cancelled"
        );

        self.drive(tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(tx).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timer-fire entry points
    // -----------------------------------------------------------------------

    /// A retry timer fired: reset the step to idle and resume.
    ///
    /// Stale firings (step no longer in temporary failure, or transaction
    /// already finished) are no-ops.
    pub async fn on_retry_fire(
        &self,
        transaction_id: &str,
        action: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let storage_key = checkpoint_key(self.model_id(), transaction_id);
        self.storage().acquire_lock(&storage_key).await?;
        let result = self.retry_fire_locked(transaction_id, action, handler).await;
        self.release(&storage_key, result).await
    }

    async fn retry_fire_locked(
        &self,
        transaction_id: &str,
        action: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let mut tx = match self.load_transaction(transaction_id, handler).await {
            Ok(tx) => tx,
            Err(EngineError::TransactionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(step) = tx.flow.step_by_action_mut(action) else {
            return Ok(());
        };
        if step.states().status != StepStatus::TemporaryFailure {
            tracing::debug!(transaction = transaction_id, action, "stale retry timer ignored");
            return Ok(());
        }
        step.states_mut().set_status(StepStatus::Idle)?;

        self.drive(&mut tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(&tx).await?;
        }
        Ok(())
    }

    /// A step timeout fired: if the step is still waiting on its handler,
    /// treat the dispatch as a permanent failure and drive compensation.
    pub async fn on_step_timeout_fire(
        &self,
        transaction_id: &str,
        action: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let storage_key = checkpoint_key(self.model_id(), transaction_id);
        self.storage().acquire_lock(&storage_key).await?;
        let result = self
            .step_timeout_locked(transaction_id, action, handler)
            .await;
        self.release(&storage_key, result).await
    }

    async fn step_timeout_locked(
        &self,
        transaction_id: &str,
        action: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let mut tx = match self.load_transaction(transaction_id, handler).await {
            Ok(tx) => tx,
            Err(EngineError::TransactionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(step) = tx.flow.step_by_action(action) else {
            return Ok(());
        };
        if step.states().status != StepStatus::Waiting {
            tracing::debug!(transaction = transaction_id, action, "stale step timeout ignored");
            return Ok(());
        }
        let step_id = step.id.clone();
        let timeout = step.policy.timeout.unwrap_or_default();

        self.events().publish(FlowEvent::Timeout {
            transaction_id: transaction_id.to_string(),
            action: Some(action.to_string()),
        });
        self.apply_failure(
            &mut tx,
            &step_id,
            StepFailure::Permanent(format!("step timed out after {timeout}s")),
        )
        .await?;

        self.drive(&mut tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(&tx).await?;
        }
        Ok(())
    }

    /// The transaction timeout fired: move the flow to rollback and resume.
    pub async fn on_transaction_timeout_fire(
        &self,
        transaction_id: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let storage_key = checkpoint_key(self.model_id(), transaction_id);
        self.storage().acquire_lock(&storage_key).await?;
        let result = self.transaction_timeout_locked(transaction_id, handler).await;
        self.release(&storage_key, result).await
    }

    async fn transaction_timeout_locked(
        &self,
        transaction_id: &str,
        handler: StepHandler,
    ) -> Result<(), EngineError> {
        let mut tx = match self.load_transaction(transaction_id, handler).await {
            Ok(tx) => tx,
            Err(EngineError::TransactionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !matches!(tx.flow.state, FlowState::NotStarted | FlowState::Invoking) {
            return Ok(());
        }

        tx.flow.state = FlowState::WaitingToCompensate;
        tracing::warn!(transaction = transaction_id, "transaction timed out");
        self.events().publish(FlowEvent::Timeout {
            transaction_id: transaction_id.to_string(),
            action: None,
        });

        self.drive(&mut tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(&tx).await?;
        }
        Ok(())
    }

    /// Build the storage timer callback for this orchestrator.
    ///
    /// Hosts register this with their storage backend so timer firings route
    /// back into the engine with the given handler.
    pub fn timer_callback(self: &Arc<Self>, handler: StepHandler) -> TimerCallback {
        let orchestrator = Arc::clone(self);
        Arc::new(move |fire: TimerFire| {
            let orchestrator = Arc::clone(&orchestrator);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let result = match (fire.kind, fire.action.as_deref()) {
                    (TimerKind::Retry, Some(action)) => {
                        orchestrator
                            .on_retry_fire(&fire.transaction_id, action, handler)
                            .await
                    }
                    (TimerKind::StepTimeout, Some(action)) => {
                        orchestrator
                            .on_step_timeout_fire(&fire.transaction_id, action, handler)
                            .await
                    }
                    (TimerKind::TransactionTimeout, _) => {
                        orchestrator
                            .on_transaction_timeout_fire(&fire.transaction_id, handler)
                            .await
                    }
                    _ => Ok(()),
                };
                if let Err(error) = result {
                    tracing::warn!(
                        transaction = fire.transaction_id.as_str(),
                        %error,
                        "timer callback failed"
                    );
                }
            })
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Load and rehydrate a transaction from its checkpoint.
    pub async fn load_transaction(
        &self,
        transaction_id: &str,
        handler: StepHandler,
    ) -> Result<Transaction, EngineError> {
        let key = checkpoint_key(self.model_id(), transaction_id);
        let mut checkpoint = self
            .storage()
            .get(&key)
            .await?
            .ok_or_else(|| EngineError::TransactionNotFound(transaction_id.to_string()))?;
        rehydrate(&mut checkpoint.flow)?;
        Ok(Transaction::from_checkpoint(checkpoint, handler))
    }

    /// Release the storage lock, preferring the operation's error over any
    /// release failure.
    async fn release<T>(
        &self,
        storage_key: &str,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let released = self.storage().release_lock(storage_key).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }
}

fn parse_key(idempotency_key: &str) -> Result<IdempotencyKey, EngineError> {
    idempotency_key
        .parse()
        .map_err(EngineError::MalformedKey)
}
