//! Generic saga runner
//!
//! Executes an ordered list of (apply, compensate) steps, recording the
//! ones that mutated state and compensating them in reverse completion
//! order on failure. A compensation that itself fails escalates to
//! reconciliation, never to a silent loss.

use super::{SagaRecord, SagaState};
use crate::error::{BridgeError, Result};
use crate::models::RemoteAccount;
use async_trait::async_trait;
use tracing::{error, warn};

/// What a successful apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    /// Remote or local state changed; the step joins the compensation list.
    Mutated,
    /// Validation or lookup only; nothing to undo.
    Validated,
}

/// How the saga reacts when this step's apply fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Undo all previously completed steps in reverse order.
    Compensate,
    /// Keep what has been applied: the mutation already made is valuable
    /// on its own (e.g. a created account without its opening deposit).
    AcceptPartial,
}

/// Values produced by earlier steps and consumed by later ones.
#[derive(Debug, Default)]
pub struct SagaContext {
    pub account: Option<RemoteAccount>,
    /// Authoritative remote balance captured before the mutating call.
    pub remote_balance_before: Option<f64>,
    /// Remote balance after the saga's mutation, when known.
    pub remote_balance: Option<f64>,
    pub local_balance: Option<f64>,
}

#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Saga state entered once this step completes, if any.
    fn state_on_success(&self) -> Option<SagaState> {
        None
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Compensate
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect>;

    async fn compensate(&self, ctx: &mut SagaContext) -> Result<()>;
}

/// Terminal result of a saga run.
#[derive(Debug)]
pub enum SagaOutcome {
    Finalized,
    /// A step failed before anything was mutated; nothing to undo.
    AbortedClean {
        failed_step: &'static str,
        cause: BridgeError,
    },
    /// Completed mutations were rolled back in reverse order.
    Compensated {
        failed_step: &'static str,
        cause: BridgeError,
    },
    /// A step failed but its predecessors' mutations were kept.
    PartiallyApplied {
        failed_step: &'static str,
        cause: BridgeError,
    },
    /// Compensation failed too; local and remote state have diverged.
    ReconciliationRequired {
        failed_step: &'static str,
        compensation_step: &'static str,
        cause: BridgeError,
    },
}

/// Run the steps in order against the record, driving the state machine
/// to a terminal state.
pub async fn run_saga(
    record: &mut SagaRecord,
    steps: Vec<Box<dyn SagaStep>>,
    ctx: &mut SagaContext,
) -> Result<SagaOutcome> {
    let mut completed: Vec<&dyn SagaStep> = Vec::new();

    for step in &steps {
        match step.apply(ctx).await {
            Ok(effect) => {
                if effect == StepEffect::Mutated {
                    record.record_step(step.name());
                    completed.push(step.as_ref());
                }
                if let Some(state) = step.state_on_success() {
                    record.transition(state)?;
                }
            }
            Err(cause) => {
                warn!(
                    saga_id = %record.saga_id,
                    step = step.name(),
                    error = %cause,
                    "saga step failed"
                );

                // A step that already knows state has diverged goes
                // straight to reconciliation.
                if matches!(cause, BridgeError::ReconciliationRequired { .. }) {
                    record.transition(SagaState::ReconciliationRequired)?;
                    return Ok(SagaOutcome::ReconciliationRequired {
                        failed_step: step.name(),
                        compensation_step: step.name(),
                        cause,
                    });
                }

                match step.failure_policy() {
                    FailurePolicy::AcceptPartial => {
                        record.transition(SagaState::Finalized)?;
                        return Ok(SagaOutcome::PartiallyApplied {
                            failed_step: step.name(),
                            cause,
                        });
                    }
                    FailurePolicy::Compensate => {
                        if completed.is_empty() {
                            record.transition(SagaState::FailedClean)?;
                            return Ok(SagaOutcome::AbortedClean {
                                failed_step: step.name(),
                                cause,
                            });
                        }

                        record.transition(SagaState::Compensating)?;
                        for done in completed.iter().rev() {
                            if let Err(comp_err) = done.compensate(ctx).await {
                                error!(
                                    saga_id = %record.saga_id,
                                    step = done.name(),
                                    error = %comp_err,
                                    "compensation failed, reconciliation required"
                                );
                                record.transition(SagaState::ReconciliationRequired)?;
                                return Ok(SagaOutcome::ReconciliationRequired {
                                    failed_step: step.name(),
                                    compensation_step: done.name(),
                                    cause,
                                });
                            }
                        }

                        record.transition(SagaState::FailedClean)?;
                        return Ok(SagaOutcome::Compensated {
                            failed_step: step.name(),
                            cause,
                        });
                    }
                }
            }
        }
    }

    record.transition(SagaState::Finalized)?;
    Ok(SagaOutcome::Finalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntentKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    /// Step double whose apply/compensate behavior is scripted.
    struct ScriptedStep {
        name: &'static str,
        effect: StepEffect,
        state: Option<SagaState>,
        policy: FailurePolicy,
        fail_apply: bool,
        fail_compensate: bool,
        compensations: Arc<AtomicU32>,
        order_log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl ScriptedStep {
        fn ok(
            name: &'static str,
            state: Option<SagaState>,
            log: Arc<std::sync::Mutex<Vec<&'static str>>>,
        ) -> Box<Self> {
            Box::new(Self {
                name,
                effect: StepEffect::Mutated,
                state,
                policy: FailurePolicy::Compensate,
                fail_apply: false,
                fail_compensate: false,
                compensations: Arc::new(AtomicU32::new(0)),
                order_log: log,
            })
        }

        fn failing(
            name: &'static str,
            log: Arc<std::sync::Mutex<Vec<&'static str>>>,
        ) -> Box<Self> {
            Box::new(Self {
                name,
                effect: StepEffect::Mutated,
                state: None,
                policy: FailurePolicy::Compensate,
                fail_apply: true,
                fail_compensate: false,
                compensations: Arc::new(AtomicU32::new(0)),
                order_log: log,
            })
        }
    }

    #[async_trait]
    impl SagaStep for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn state_on_success(&self) -> Option<SagaState> {
            self.state
        }

        fn failure_policy(&self) -> FailurePolicy {
            self.policy
        }

        async fn apply(&self, _ctx: &mut SagaContext) -> Result<StepEffect> {
            if self.fail_apply {
                return Err(BridgeError::Network("scripted apply failure".into()));
            }
            Ok(self.effect)
        }

        async fn compensate(&self, _ctx: &mut SagaContext) -> Result<()> {
            self.order_log.lock().unwrap().push(self.name);
            self.compensations.fetch_add(1, Ordering::SeqCst);
            if self.fail_compensate {
                return Err(BridgeError::Network("scripted compensate failure".into()));
            }
            Ok(())
        }
    }

    fn record() -> SagaRecord {
        SagaRecord::new(IntentKind::Deposit, Uuid::new_v4(), 50.0)
    }

    #[tokio::test]
    async fn test_all_steps_succeed_finalizes() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn SagaStep>> = vec![
            ScriptedStep::ok("debit_local", Some(SagaState::LocalReserved), log.clone()),
            ScriptedStep::ok("remote_deposit", Some(SagaState::RemoteApplied), log.clone()),
        ];

        let mut rec = record();
        let mut ctx = SagaContext::default();
        let outcome = run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        assert!(matches!(outcome, SagaOutcome::Finalized));
        assert_eq!(rec.state, SagaState::Finalized);
        assert_eq!(rec.completed_steps.len(), 2);
    }

    #[tokio::test]
    async fn test_compensation_runs_in_reverse_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn SagaStep>> = vec![
            ScriptedStep::ok("first", Some(SagaState::LocalReserved), log.clone()),
            ScriptedStep::ok("second", Some(SagaState::RemoteApplied), log.clone()),
            ScriptedStep::failing("third", log.clone()),
        ];

        let mut rec = record();
        let mut ctx = SagaContext::default();
        let outcome = run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        assert!(matches!(outcome, SagaOutcome::Compensated { .. }));
        assert_eq!(rec.state, SagaState::FailedClean);
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_failure_with_no_mutations_aborts_clean() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut validate = ScriptedStep::failing("validate", log.clone());
        validate.effect = StepEffect::Validated;

        let steps: Vec<Box<dyn SagaStep>> = vec![validate];
        let mut rec = record();
        let mut ctx = SagaContext::default();
        let outcome = run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        assert!(matches!(outcome, SagaOutcome::AbortedClean { .. }));
        assert_eq!(rec.state, SagaState::FailedClean);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validated_steps_are_never_compensated() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut validate = ScriptedStep::ok("validate", None, log.clone());
        validate.effect = StepEffect::Validated;

        let steps: Vec<Box<dyn SagaStep>> = vec![
            validate,
            ScriptedStep::ok("mutate", Some(SagaState::LocalReserved), log.clone()),
            ScriptedStep::failing("fail", log.clone()),
        ];

        let mut rec = record();
        let mut ctx = SagaContext::default();
        run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        // Only the mutating step is compensated.
        assert_eq!(*log.lock().unwrap(), vec!["mutate"]);
        assert_eq!(rec.completed_steps.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_compensation_escalates_to_reconciliation() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sticky = ScriptedStep::ok("remote_withdraw", Some(SagaState::RemoteApplied), log.clone());
        sticky.fail_compensate = true;

        let steps: Vec<Box<dyn SagaStep>> = vec![
            sticky,
            ScriptedStep::failing("credit_local", log.clone()),
        ];

        let mut rec = record();
        let mut ctx = SagaContext::default();
        let outcome = run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        match outcome {
            SagaOutcome::ReconciliationRequired {
                failed_step,
                compensation_step,
                ..
            } => {
                assert_eq!(failed_step, "credit_local");
                assert_eq!(compensation_step, "remote_withdraw");
            }
            other => panic!("expected reconciliation, got {:?}", other),
        }
        assert_eq!(rec.state, SagaState::ReconciliationRequired);
    }

    #[tokio::test]
    async fn test_accept_partial_keeps_mutations() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut partial = ScriptedStep::failing("opening_deposit", log.clone());
        partial.policy = FailurePolicy::AcceptPartial;

        let steps: Vec<Box<dyn SagaStep>> = vec![
            ScriptedStep::ok("debit_local", Some(SagaState::LocalReserved), log.clone()),
            ScriptedStep::ok("create_remote", Some(SagaState::RemoteApplied), log.clone()),
            partial,
        ];

        let mut rec = record();
        let mut ctx = SagaContext::default();
        let outcome = run_saga(&mut rec, steps, &mut ctx).await.unwrap();

        assert!(matches!(outcome, SagaOutcome::PartiallyApplied { .. }));
        assert_eq!(rec.state, SagaState::Finalized);
        // No compensation ran.
        assert!(log.lock().unwrap().is_empty());
    }
}
