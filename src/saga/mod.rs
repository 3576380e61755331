//! Saga records, state machine and per-user serialization
//!
//! Each financial intent runs as a saga: an ordered list of steps whose
//! completed mutations are recorded so partial failure can be undone in
//! reverse order. State transitions are validated explicitly; an
//! unexpected jump is a bug, not an assumption.

pub mod runner;

pub use runner::{run_saga, FailurePolicy, SagaContext, SagaOutcome, SagaStep, StepEffect};

use crate::error::{BridgeError, Result};
use crate::models::IntentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Initiated,
    LocalReserved,
    RemoteApplied,
    Finalized,
    Compensating,
    FailedClean,
    ReconciliationRequired,
}

impl SagaState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Finalized | SagaState::FailedClean | SagaState::ReconciliationRequired
        )
    }

    /// Legal forward transitions of the saga state machine.
    pub fn can_transition(self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Initiated, LocalReserved)
                | (Initiated, RemoteApplied)
                | (Initiated, FailedClean)
                | (LocalReserved, RemoteApplied)
                | (LocalReserved, Compensating)
                | (LocalReserved, FailedClean)
                | (LocalReserved, Finalized)
                | (RemoteApplied, Finalized)
                | (RemoteApplied, Compensating)
                | (Compensating, FailedClean)
                // A failed re-check after an unknown outcome can flag
                // divergence before any compensation started.
                | (Initiated, ReconciliationRequired)
                | (LocalReserved, ReconciliationRequired)
                | (RemoteApplied, ReconciliationRequired)
                | (Compensating, ReconciliationRequired)
        )
    }
}

/// A completed step with enough data to account for its compensation.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedStep {
    pub name: &'static str,
    pub completed_at: DateTime<Utc>,
}

/// The record of one in-flight or archived saga.
#[derive(Debug, Clone, Serialize)]
pub struct SagaRecord {
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub kind: IntentKind,
    pub amount: f64,
    pub state: SagaState,
    /// Only steps that actually mutated remote or local state are listed
    /// here; validated-but-not-applied steps never are.
    pub completed_steps: Vec<CompletedStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(kind: IntentKind, user_id: Uuid, amount: f64) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            state: SagaState::Initiated,
            completed_steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: SagaState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition(next) {
            return Err(BridgeError::InvalidTransition(format!(
                "saga {}: {:?} -> {:?}",
                self.saga_id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_step(&mut self, name: &'static str) {
        self.completed_steps.push(CompletedStep {
            name,
            completed_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}

/// Serializes sagas per user: a second intent for a user with one already
/// in flight is rejected instead of racing the ledger balance.
pub struct UserGate {
    inflight: Mutex<HashSet<Uuid>>,
}

impl UserGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inflight: Mutex::new(HashSet::new()),
        })
    }

    pub fn try_acquire(self: &Arc<Self>, user: Uuid) -> Result<UserPermit> {
        let mut inflight = self.inflight.lock().unwrap();
        if !inflight.insert(user) {
            return Err(BridgeError::OperationInFlight(user));
        }
        Ok(UserPermit {
            gate: Arc::clone(self),
            user,
        })
    }
}

/// Releases the user's slot when dropped, i.e. when its saga reaches a
/// terminal state.
pub struct UserPermit {
    gate: Arc<UserGate>,
    user: Uuid,
}

impl Drop for UserPermit {
    fn drop(&mut self) {
        let mut inflight = self.gate.inflight.lock().unwrap();
        inflight.remove(&self.user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut record = SagaRecord::new(IntentKind::Deposit, Uuid::new_v4(), 50.0);
        assert!(record.transition(SagaState::LocalReserved).is_ok());
        assert!(record.transition(SagaState::RemoteApplied).is_ok());
        assert!(record.transition(SagaState::Finalized).is_ok());
        assert!(record.state.is_terminal());
    }

    #[test]
    fn test_unexpected_jump_rejected() {
        let mut record = SagaRecord::new(IntentKind::Deposit, Uuid::new_v4(), 50.0);
        let err = record.transition(SagaState::Finalized).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTransition(_)));
        assert_eq!(record.state, SagaState::Initiated);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = SagaRecord::new(IntentKind::Withdraw, Uuid::new_v4(), 50.0);
        record.transition(SagaState::Initiated).unwrap();
        record.transition(SagaState::LocalReserved).unwrap();
        record.transition(SagaState::Compensating).unwrap();
        record.transition(SagaState::FailedClean).unwrap();
        assert!(record.transition(SagaState::Finalized).is_err());
    }

    #[test]
    fn test_user_gate_rejects_second_acquire() {
        let gate = UserGate::new();
        let user = Uuid::new_v4();

        let permit = gate.try_acquire(user).unwrap();
        let err = match gate.try_acquire(user) {
            Ok(_) => panic!("second acquire for the same user should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, BridgeError::OperationInFlight(_)));

        // Independent users are unaffected.
        let _other = gate.try_acquire(Uuid::new_v4()).unwrap();

        drop(permit);
        assert!(gate.try_acquire(user).is_ok());
    }
}
