//! The orchestrator: scheduling pass, execution driver, and outcome rules.
//!
//! One orchestrator is bound to a model id and a validated definition; it is
//! safe to share across many transactions and holds no per-transaction
//! mutable state beyond the `Transaction` it is currently driving.
//!
//! # Driving a flow
//!
//! `resume` runs the driver loop: an eligibility pass (`check_all_steps`)
//! collects dispatchable steps, `dispatch` launches their handlers into a
//! `tokio::task::JoinSet`, and every settlement feeds back through the
//! outcome rules before the next pass. Because the pass re-runs after each
//! settlement, a `no_wait` successor dispatches while its uncle branch is
//! still in flight.
//!
//! The driver suspends while awaiting handler settlement and checkpoint
//! writes, and exits with the flow non-terminal when steps are awaiting
//! external completion or a retry timer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use sagara_types::checkpoint::{Checkpoint, StepOutputs};
use sagara_types::definition::StepNode;
use sagara_types::error::{FlowErrorRecord, StepFailure};
use sagara_types::event::FlowEvent;
use sagara_types::flow::{Flow, FlowState};
use sagara_types::payload::{
    IdempotencyKey, PayloadMetadata, RESPONSE_KEY, TransactionPayload,
};
use sagara_types::step::{Phase, StepState, StepStatus};
use serde_json::Value;
use tokio::task::JoinSet;

use super::EngineError;
use super::checkpoint::{self, record_output};
use super::definition::validate_definition;
use super::eligibility::{can_compensate, can_continue, can_invoke};
use super::topology::{Orderings, build_orderings, build_steps};
use crate::event::EventBus;
use crate::storage::{ArchiveOptions, FlowStorage, TimerRequest, checkpoint_key};

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// What a handler produced for one dispatch.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// The step completed with a response.
    Completed(Value),
    /// The async sentinel: the step completes out-of-band via
    /// `register_step_success` / `register_step_failure`.
    Async,
}

/// The caller-supplied step handler.
///
/// Invoked as `handler(action, phase, payload)`. Returning
/// `HandlerOutcome::Async` leaves the step waiting; returning an error
/// triggers the failure rules.
pub type StepHandler = Arc<
    dyn Fn(String, Phase, TransactionPayload) -> BoxFuture<'static, Result<HandlerOutcome, StepFailure>>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// ModelOptions
// ---------------------------------------------------------------------------

/// Per-model execution options.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Transaction-wide timeout in seconds.
    pub timeout: Option<u64>,
    /// Persist checkpoints. When false the model runs fire-and-forget and
    /// async steps are rejected at transaction start.
    pub store_execution: bool,
    /// Retain terminal checkpoints for this many seconds (archived instead
    /// of deleted).
    pub retention_time: Option<u64>,
    /// Starting a transaction whose id already has a checkpoint returns the
    /// existing transaction instead of failing.
    pub idempotent: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            store_execution: true,
            retention_time: None,
            idempotent: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A flow being driven, together with its handler and accumulated outputs.
pub struct Transaction {
    pub flow: Flow,
    /// Step-level errors captured so far (never rethrown to the driver).
    pub errors: Vec<FlowErrorRecord>,
    /// Per-action handler outputs, keyed by action.
    pub context: HashMap<String, StepOutputs>,
    handler: StepHandler,
}

impl Transaction {
    pub fn new(flow: Flow, handler: StepHandler) -> Self {
        Self {
            flow,
            errors: Vec::new(),
            context: HashMap::new(),
            handler,
        }
    }

    /// Rebuild a transaction from a checkpoint, binding a handler.
    pub fn from_checkpoint(checkpoint: Checkpoint, handler: StepHandler) -> Self {
        Self {
            flow: checkpoint.flow,
            errors: checkpoint.errors,
            context: checkpoint.context,
            handler,
        }
    }

    /// Snapshot this transaction as a checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            flow: self.flow.clone(),
            errors: self.errors.clone(),
            context: self.context.clone(),
        }
    }

    pub fn handler(&self) -> StepHandler {
        Arc::clone(&self.handler)
    }

    pub fn state(&self) -> FlowState {
        self.flow.state
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.flow.transaction_id)
            .field("state", &self.flow.state)
            .field("errors", &self.errors.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SchedulerPass
// ---------------------------------------------------------------------------

/// Result of one eligibility pass over the step table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerPass {
    /// Ids of steps to dispatch next.
    pub next: Vec<String>,
    /// Executable steps in the flow (root excluded).
    pub total: usize,
    /// Steps not yet settled.
    pub remaining: usize,
    /// Steps settled in the current direction.
    pub completed: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives flows of one transaction model against pluggable storage.
pub struct Orchestrator<S> {
    model_id: String,
    definition: StepNode,
    options: ModelOptions,
    storage: Arc<S>,
    events: EventBus,
    orderings: Orderings,
}

impl<S: FlowStorage + 'static> Orchestrator<S> {
    /// Build an orchestrator for a validated definition.
    ///
    /// The invoke/compensate orderings are computed once here and shared by
    /// every flow of this model.
    pub fn new(
        model_id: impl Into<String>,
        definition: StepNode,
        options: ModelOptions,
        storage: Arc<S>,
        events: EventBus,
    ) -> Result<Self, EngineError> {
        validate_definition(&definition)?;
        let steps = build_steps(&definition, None)?;
        let orderings = build_orderings(&steps)?;
        Ok(Self {
            model_id: model_id.into(),
            definition,
            options,
            storage,
            events,
            orderings,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    // -----------------------------------------------------------------------
    // Transaction lifecycle
    // -----------------------------------------------------------------------

    /// Create a flow for `transaction_id` and return its transaction handle.
    ///
    /// When the model stores execution, an initial checkpoint is written and
    /// the transaction timeout (if configured) is scheduled. Async steps are
    /// rejected for fire-and-forget models.
    pub async fn begin_transaction(
        &self,
        transaction_id: impl Into<String>,
        handler: StepHandler,
        input: Value,
    ) -> Result<Transaction, EngineError> {
        let transaction_id = transaction_id.into();
        let steps = build_steps(&self.definition, None)?;

        let has_async = steps
            .values()
            .any(|s| s.policy.is_async || s.policy.compensate_async);
        if has_async && !self.options.store_execution {
            return Err(EngineError::Validation(
                "async steps require execution storage (store_execution is false)".to_string(),
            ));
        }
        let has_remote = steps.values().any(|s| s.policy.background_execution);

        if self.options.store_execution {
            let key = checkpoint_key(&self.model_id, &transaction_id);
            if let Some(existing) = self.storage.get(&key).await? {
                if self.options.idempotent {
                    return Ok(Transaction::from_checkpoint(existing, handler));
                }
                return Err(EngineError::IllegalState(format!(
                    "transaction '{transaction_id}' already exists"
                )));
            }
        }

        let flow = Flow {
            model_id: self.model_id.clone(),
            transaction_id: transaction_id.clone(),
            state: FlowState::NotStarted,
            input,
            has_skipped_steps: false,
            has_failed_steps: false,
            has_async_steps: has_async,
            has_remote_steps: has_remote,
            cancelled_at: None,
            started_at: Some(Utc::now()),
            steps,
            definition: self.definition.clone(),
        };
        let tx = Transaction::new(flow, handler);

        tracing::info!(
            model = self.model_id.as_str(),
            transaction = transaction_id.as_str(),
            "transaction created"
        );
        self.events.publish(FlowEvent::Begin {
            model_id: self.model_id.clone(),
            transaction_id: transaction_id.clone(),
        });

        self.save_checkpoint(&tx).await?;
        if let Some(timeout) = self.options.timeout {
            self.storage
                .schedule_transaction_timeout(TimerRequest {
                    model_id: self.model_id.clone(),
                    transaction_id: transaction_id.clone(),
                    action: None,
                    fire_at: Utc::now() + chrono::Duration::seconds(timeout as i64),
                    interval_secs: timeout,
                })
                .await?;
        }
        Ok(tx)
    }

    /// Drive the flow until no step is dispatchable: terminal, awaiting
    /// external completion, or awaiting a retry timer.
    pub async fn resume(&self, tx: &mut Transaction) -> Result<(), EngineError> {
        if tx.flow.state.is_terminal() {
            return Ok(());
        }
        if tx.flow.state == FlowState::NotStarted {
            tx.flow.state = FlowState::Invoking;
        }
        self.events.publish(FlowEvent::Resume {
            model_id: self.model_id.clone(),
            transaction_id: tx.flow.transaction_id.clone(),
        });
        tracing::debug!(
            transaction = tx.flow.transaction_id.as_str(),
            state = ?tx.flow.state,
            "resuming flow"
        );

        self.drive(tx).await?;
        if !tx.flow.state.is_terminal() {
            self.save_checkpoint(tx).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver loop
    // -----------------------------------------------------------------------

    pub(crate) async fn drive(&self, tx: &mut Transaction) -> Result<(), EngineError> {
        let mut in_flight: JoinSet<(String, Result<HandlerOutcome, StepFailure>)> = JoinSet::new();

        loop {
            let pass = self.check_all_steps(tx).await?;
            for step_id in &pass.next {
                self.dispatch(tx, step_id, &mut in_flight).await?;
            }

            match in_flight.join_next().await {
                Some(joined) => {
                    let (step_id, outcome) = joined
                        .map_err(|e| EngineError::Execution(format!("task join error: {e}")))?;
                    match outcome {
                        Ok(HandlerOutcome::Completed(response)) => {
                            self.apply_success(tx, &step_id, response).await?;
                        }
                        Ok(HandlerOutcome::Async) => {
                            self.note_awaiting(tx, &step_id).await?;
                        }
                        Err(failure) => {
                            self.apply_failure(tx, &step_id, failure).await?;
                        }
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// One eligibility pass: collect dispatchable steps, account for
    /// waiting ones, flip to compensation when rollback can begin, and
    /// finalize the flow once every step has settled.
    pub(crate) async fn check_all_steps(
        &self,
        tx: &mut Transaction,
    ) -> Result<SchedulerPass, EngineError> {
        loop {
            let flow = &tx.flow;
            let order = if flow.state == FlowState::Compensating {
                &self.orderings.compensate
            } else {
                &self.orderings.invoke
            };

            let total = flow.total_steps();
            let mut next = Vec::new();
            let mut completed = 0usize;
            let mut has_waiting = false;

            for step_id in order {
                let step = flow
                    .steps
                    .get(step_id)
                    .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
                if !can_continue(flow, step) {
                    continue;
                }
                let exec = step.states();
                let awaiting_timer = exec.status == StepStatus::TemporaryFailure
                    && step.policy.retry_interval.is_some()
                    && step.failures <= step.policy.max_retries;
                if exec.status == StepStatus::Waiting || awaiting_timer {
                    has_waiting = true;
                    continue;
                }
                if can_invoke(flow.state, step) || can_compensate(flow.state, step) {
                    next.push(step_id.clone());
                } else {
                    completed += 1;
                }
            }

            if flow.state == FlowState::WaitingToCompensate && next.is_empty() && !has_waiting {
                self.begin_rollback(tx)?;
                continue;
            }

            if next.is_empty() && !has_waiting && completed == total && !flow.state.is_terminal() {
                self.finalize(tx).await?;
            }

            return Ok(SchedulerPass {
                next,
                total,
                remaining: total.saturating_sub(completed),
                completed,
            });
        }
    }

    /// Flip the flow into compensation: arm the compensate phase of every
    /// completed or permanently failed step that allows compensation, then
    /// let the pass re-run against the backward ordering.
    fn begin_rollback(&self, tx: &mut Transaction) -> Result<(), EngineError> {
        tx.flow.state = FlowState::Compensating;
        tracing::info!(
            transaction = tx.flow.transaction_id.as_str(),
            "beginning compensation"
        );
        self.events.publish(FlowEvent::CompensateBegin {
            model_id: self.model_id.clone(),
            transaction_id: tx.flow.transaction_id.clone(),
        });

        for step in tx.flow.steps.values_mut() {
            if step.is_root() || step.policy.no_compensation {
                continue;
            }
            let armed = step.invoke.state == StepState::Done
                || step.invoke.status == StepStatus::PermanentFailure;
            if armed {
                step.begin_compensation()?;
            }
        }
        Ok(())
    }

    /// Settle the flow into its terminal state, emit FINISH, and delete or
    /// archive the checkpoint.
    async fn finalize(&self, tx: &mut Transaction) -> Result<(), EngineError> {
        let mut fatal = false;
        let mut any_reverted = false;
        let mut has_failed = false;
        let mut has_skipped = false;

        for step in tx.flow.steps.values() {
            if step.is_root() {
                continue;
            }
            if step.invoke.state == StepState::Skipped {
                has_skipped = true;
            }
            if step.compensate.state == StepState::Reverted {
                any_reverted = true;
            }
            if step.compensate.state == StepState::Failed {
                fatal = true;
                has_failed = true;
            }
            if step.invoke.state == StepState::Failed {
                has_failed = true;
                if !step.step_failed && !step.policy.continue_on_permanent_failure {
                    fatal = true;
                }
            }
        }

        tx.flow.state = if fatal {
            FlowState::Failed
        } else if any_reverted {
            FlowState::Reverted
        } else {
            FlowState::Done
        };
        tx.flow.has_failed_steps = has_failed;
        tx.flow.has_skipped_steps = has_skipped;

        tracing::info!(
            transaction = tx.flow.transaction_id.as_str(),
            state = ?tx.flow.state,
            errors = tx.errors.len(),
            "flow finished"
        );

        if self.options.store_execution {
            let key = checkpoint_key(&self.model_id, &tx.flow.transaction_id);
            self.storage
                .clear_transaction_timeout(&self.model_id, &tx.flow.transaction_id)
                .await?;
            match self.options.retention_time {
                Some(retention) => {
                    self.storage
                        .archive(
                            &key,
                            &ArchiveOptions {
                                retention_secs: Some(retention),
                            },
                        )
                        .await?;
                }
                None => self.storage.delete(&key).await?,
            }
        }

        self.events.publish(FlowEvent::Finish {
            model_id: self.model_id.clone(),
            transaction_id: tx.flow.transaction_id.clone(),
            state: tx.flow.state,
            errors: tx.errors.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Launch one step's handler into the in-flight set.
    ///
    /// The handler function itself runs here, in pass order; only the
    /// returned future goes to the join set.
    async fn dispatch(
        &self,
        tx: &mut Transaction,
        step_id: &str,
        in_flight: &mut JoinSet<(String, Result<HandlerOutcome, StepFailure>)>,
    ) -> Result<(), EngineError> {
        let compensating = tx.flow.state == FlowState::Compensating;
        let payload = self.build_payload(tx, step_id)?;
        let handler = tx.handler();

        let step = tx
            .flow
            .steps
            .get_mut(step_id)
            .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
        let action = step
            .action
            .clone()
            .ok_or_else(|| EngineError::Execution("dispatched the root step".to_string()))?;
        let phase = if compensating {
            Phase::Compensate
        } else {
            Phase::Invoke
        };

        let now = Utc::now();
        step.last_attempt = Some(now);
        step.started_at.get_or_insert(now);
        step.attempts += 1;
        let attempt = step.attempts;

        let exec = step.states_mut();
        if exec.state == StepState::NotStarted {
            exec.set_state(if compensating {
                StepState::Compensating
            } else {
                StepState::Invoking
            })?;
        }
        exec.set_status(StepStatus::Waiting)?;
        let timeout = step.policy.timeout;

        tracing::debug!(
            transaction = tx.flow.transaction_id.as_str(),
            action = action.as_str(),
            %phase,
            attempt,
            "dispatching step"
        );
        self.events.publish(FlowEvent::StepBegin {
            transaction_id: tx.flow.transaction_id.clone(),
            action: action.clone(),
            phase,
            attempt,
        });

        let future = handler(action.clone(), phase, payload);
        let id = step_id.to_string();
        in_flight.spawn(async move { (id, future.await) });

        if let Some(timeout) = timeout {
            self.storage
                .schedule_step_timeout(TimerRequest {
                    model_id: self.model_id.clone(),
                    transaction_id: tx.flow.transaction_id.clone(),
                    action: Some(action),
                    fire_at: Utc::now() + chrono::Duration::seconds(timeout as i64),
                    interval_secs: timeout,
                })
                .await?;
        }
        Ok(())
    }

    fn build_payload(&self, tx: &Transaction, step_id: &str) -> Result<TransactionPayload, EngineError> {
        let flow = &tx.flow;
        let step = flow
            .steps
            .get(step_id)
            .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
        let action = step
            .action
            .as_deref()
            .ok_or_else(|| EngineError::Execution("payload for the root step".to_string()))?;
        let phase = if flow.state == FlowState::Compensating {
            Phase::Compensate
        } else {
            Phase::Invoke
        };

        let mut data = flow.input.clone();
        let parent = step.parent_id().and_then(|id| flow.steps.get(id));
        if let Some(parent) = parent {
            if parent.policy.forward_response {
                if let Some(response) = &parent.response {
                    if !data.is_object() {
                        data = Value::Object(serde_json::Map::new());
                    }
                    if let Some(map) = data.as_object_mut() {
                        map.insert(RESPONSE_KEY.to_string(), response.clone());
                    }
                }
            }
        }

        Ok(TransactionPayload {
            metadata: PayloadMetadata {
                producer: self.model_id.clone(),
                reply_to_topic: format!("trans:{}", self.model_id),
                idempotency_key: IdempotencyKey::new(
                    flow.transaction_id.clone(),
                    action,
                    phase,
                )
                .to_string(),
                action: action.to_string(),
                action_type: phase,
                attempt: step.attempts + 1,
                timestamp: Utc::now(),
            },
            data,
        })
    }

    // -----------------------------------------------------------------------
    // Outcome rules
    // -----------------------------------------------------------------------

    /// Apply a successful handler result to a step.
    pub(crate) async fn apply_success(
        &self,
        tx: &mut Transaction,
        step_id: &str,
        response: Value,
    ) -> Result<(), EngineError> {
        let transaction_id = tx.flow.transaction_id.clone();
        let step = tx
            .flow
            .steps
            .get_mut(step_id)
            .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
        let action = step.action.clone().unwrap_or_default();
        let phase = step.active_phase();
        let compensating = step.step_failed;

        if step.policy.save_response || step.policy.forward_response {
            step.response = Some(response.clone());
        }
        let exec = step.states_mut();
        exec.set_status(StepStatus::Ok)?;
        exec.set_state(if compensating {
            StepState::Reverted
        } else {
            StepState::Done
        })?;

        let clear_timeout = step.policy.timeout.is_some();
        let clear_retry = step.policy.retry_interval.is_some();
        let is_async = if compensating {
            step.policy.compensate_async
        } else {
            step.policy.is_async
        };

        record_output(&mut tx.context, &action, phase, response);

        tracing::debug!(
            transaction = transaction_id.as_str(),
            action = action.as_str(),
            %phase,
            "step succeeded"
        );
        self.events.publish(if compensating {
            FlowEvent::CompensateStepSuccess {
                transaction_id: transaction_id.clone(),
                action: action.clone(),
            }
        } else {
            FlowEvent::StepSuccess {
                transaction_id: transaction_id.clone(),
                action: action.clone(),
            }
        });

        self.clear_step_timers(&transaction_id, &action, clear_timeout, clear_retry)
            .await?;
        if is_async {
            self.save_checkpoint(tx).await?;
        }
        Ok(())
    }

    /// Apply a handler failure to a step: retry bookkeeping, permanent
    /// failure, skip cascade, or rollback trigger.
    pub(crate) async fn apply_failure(
        &self,
        tx: &mut Transaction,
        step_id: &str,
        failure: StepFailure,
    ) -> Result<(), EngineError> {
        let transaction_id = tx.flow.transaction_id.clone();
        let step = tx
            .flow
            .steps
            .get_mut(step_id)
            .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
        let action = step.action.clone().unwrap_or_default();
        let phase = step.active_phase();
        let compensating = step.step_failed;

        step.failures += 1;
        if failure.is_permanent() {
            step.failures = step.policy.max_retries + 1;
        }
        step.states_mut().set_status(StepStatus::TemporaryFailure)?;

        let permanent = step.failures > step.policy.max_retries;
        let will_retry = !permanent;
        if permanent {
            step.states_mut().set_status(StepStatus::PermanentFailure)?;
            step.states_mut().set_state(StepState::Failed)?;
        }

        let failures = step.failures;
        let retry_interval = step.policy.retry_interval;
        let continue_on_failure = step.policy.continue_on_permanent_failure;
        let clear_timeout = step.policy.timeout.is_some();
        let is_async = if compensating {
            step.policy.compensate_async
        } else {
            step.policy.is_async
        };

        tracing::debug!(
            transaction = transaction_id.as_str(),
            action = action.as_str(),
            %phase,
            failures,
            permanent,
            error = failure.message(),
            "step failed"
        );

        if permanent {
            tx.errors.push(FlowErrorRecord {
                action: action.clone(),
                phase,
                error: failure.message().to_string(),
            });

            if phase == Phase::Invoke {
                if continue_on_failure {
                    self.skip_descendants(tx, step_id)?;
                } else if tx.flow.state == FlowState::Invoking {
                    tx.flow.state = FlowState::WaitingToCompensate;
                }
            }
            // A permanent compensation failure is fatal; finalize classifies
            // the flow as FAILED once the remaining steps settle.

            self.clear_step_timers(&transaction_id, &action, clear_timeout, retry_interval.is_some())
                .await?;
        } else if let Some(interval) = retry_interval {
            self.storage
                .schedule_retry(TimerRequest {
                    model_id: self.model_id.clone(),
                    transaction_id: transaction_id.clone(),
                    action: Some(action.clone()),
                    fire_at: Utc::now() + chrono::Duration::seconds(interval as i64),
                    interval_secs: interval,
                })
                .await?;
        }

        self.events.publish(if compensating {
            FlowEvent::CompensateStepFailure {
                transaction_id,
                action,
                error: failure.message().to_string(),
                will_retry,
            }
        } else {
            FlowEvent::StepFailure {
                transaction_id,
                action,
                error: failure.message().to_string(),
                will_retry,
            }
        });

        if is_async {
            self.save_checkpoint(tx).await?;
        }
        Ok(())
    }

    /// An async step's handler returned the sentinel: leave it waiting and
    /// persist a checkpoint so external completion can find it.
    pub(crate) async fn note_awaiting(
        &self,
        tx: &mut Transaction,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let step = tx
            .flow
            .steps
            .get(step_id)
            .ok_or_else(|| EngineError::Execution(format!("missing step '{step_id}'")))?;
        let action = step.action.clone().unwrap_or_default();
        let phase = step.active_phase();
        tx.flow.has_async_steps = true;

        let key = IdempotencyKey::new(tx.flow.transaction_id.clone(), action.clone(), phase);
        tracing::debug!(
            transaction = tx.flow.transaction_id.as_str(),
            action = action.as_str(),
            %phase,
            "step awaiting external completion"
        );
        self.events.publish(FlowEvent::StepAwaiting {
            transaction_id: tx.flow.transaction_id.clone(),
            action,
            phase,
            idempotency_key: key.to_string(),
        });

        self.save_checkpoint(tx).await?;
        Ok(())
    }

    /// Mark every descendant of a permanently failed step as skipped.
    fn skip_descendants(&self, tx: &mut Transaction, step_id: &str) -> Result<(), EngineError> {
        let mut queue: Vec<String> = tx
            .flow
            .steps
            .get(step_id)
            .map(|s| s.next.clone())
            .unwrap_or_default();

        while let Some(id) = queue.pop() {
            let Some(step) = tx.flow.steps.get_mut(&id) else {
                continue;
            };
            queue.extend(step.next.iter().cloned());
            if step.invoke.state == StepState::NotStarted {
                step.invoke.set_state(StepState::Skipped)?;
                let action = step.action.clone().unwrap_or_default();
                self.events.publish(FlowEvent::StepSkipped {
                    transaction_id: tx.flow.transaction_id.clone(),
                    action,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    pub(crate) async fn save_checkpoint(&self, tx: &Transaction) -> Result<(), EngineError> {
        if !self.options.store_execution {
            return Ok(());
        }
        let key = checkpoint_key(&self.model_id, &tx.flow.transaction_id);
        self.storage.save(&key, &tx.checkpoint(), None).await?;
        Ok(())
    }

    async fn clear_step_timers(
        &self,
        transaction_id: &str,
        action: &str,
        timeout: bool,
        retry: bool,
    ) -> Result<(), EngineError> {
        if timeout {
            self.storage
                .clear_step_timeout(&self.model_id, transaction_id, action)
                .await?;
        }
        if retry {
            self.storage
                .clear_retry(&self.model_id, transaction_id, action)
                .await?;
        }
        Ok(())
    }

    /// Checkpoints of this model's flows that have not reached a terminal
    /// state. Used by hosts to resume work after a restart.
    pub async fn list_open_transactions(&self) -> Result<Vec<Checkpoint>, EngineError> {
        let prefix = format!("{}:", self.model_id);
        let mut open = Vec::new();
        for (key, mut checkpoint) in self.storage.list().await? {
            if !key.starts_with(&prefix) || checkpoint.flow.state.is_terminal() {
                continue;
            }
            checkpoint::rehydrate(&mut checkpoint.flow)?;
            open.push(checkpoint);
        }
        Ok(open)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_options_defaults() {
        let options = ModelOptions::default();
        assert!(options.store_execution);
        assert!(options.timeout.is_none());
        assert!(options.retention_time.is_none());
        assert!(!options.idempotent);
    }

    #[test]
    fn scheduler_pass_accounting() {
        let pass = SchedulerPass {
            next: vec!["_root.a".to_string()],
            total: 3,
            remaining: 2,
            completed: 1,
        };
        assert_eq!(pass.total - pass.completed, pass.remaining);
    }

    #[test]
    fn transaction_debug_omits_handler() {
        let handler: StepHandler = Arc::new(|_, _, _| {
            Box::pin(async { Ok(HandlerOutcome::Completed(Value::Null)) })
        });
        let flow = Flow {
            model_id: "m".to_string(),
            transaction_id: "tx".to_string(),
            state: FlowState::NotStarted,
            input: Value::Null,
            has_skipped_steps: false,
            has_failed_steps: false,
            has_async_steps: false,
            has_remote_steps: false,
            cancelled_at: None,
            started_at: None,
            steps: HashMap::new(),
            definition: StepNode::root(vec![StepNode::action("a")]),
        };
        let tx = Transaction::new(flow, handler);
        let debug = format!("{tx:?}");
        assert!(debug.contains("Transaction"));
        assert!(debug.contains("tx"));
    }
}
