//! Core data models for the custody bridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CreateAccount,
    Deposit,
    Withdraw,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntentKind::CreateAccount => "create_account",
            IntentKind::Deposit => "deposit",
            IntentKind::Withdraw => "withdraw",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
}

/// Where the user's money ended up after an intent ran.
///
/// Every user-visible failure names one of these explicitly; a bare
/// "error occurred" is never surfaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalanceState {
    /// No mutation happened on either side.
    NotCharged,
    /// Local debit was rolled back in full.
    Refunded,
    /// Both sides reflect the operation.
    Settled,
    /// Remote side holds state the local side does not (or vice versa)
    /// by design, e.g. an account created without its opening deposit.
    PartiallyApplied,
    /// Balances are known to have diverged; an operator must intervene.
    PendingReview,
}

impl fmt::Display for BalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BalanceState::NotCharged => "not charged",
            BalanceState::Refunded => "refunded",
            BalanceState::Settled => "settled",
            BalanceState::PartiallyApplied => "partially applied",
            BalanceState::PendingReview => "pending manual review",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
    PartialSuccess,
    Refunded,
    ReconciliationRequired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOp {
    Add,
    Subtract,
    Set,
}

//
// ================= Intent =================
//

/// A structured financial intent, supplied by the front-end collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialIntent {
    pub intent_id: Uuid,
    pub user_id: Uuid,
    pub kind: IntentKind,
    #[serde(default)]
    pub amount: f64,
    pub login: Option<String>,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FinancialIntent {
    pub fn deposit(user_id: Uuid, amount: f64) -> Self {
        Self::new(user_id, IntentKind::Deposit, amount)
    }

    pub fn withdraw(user_id: Uuid, amount: f64) -> Self {
        Self::new(user_id, IntentKind::Withdraw, amount)
    }

    pub fn create_account(user_id: Uuid, login: String, password: String, opening: f64) -> Self {
        let mut intent = Self::new(user_id, IntentKind::CreateAccount, opening);
        intent.login = Some(login);
        intent.password = Some(password);
        intent
    }

    fn new(user_id: Uuid, kind: IntentKind, amount: f64) -> Self {
        Self {
            intent_id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            login: None,
            password: None,
            created_at: Utc::now(),
        }
    }
}

//
// ================= Remote account =================
//

/// A partner-platform account owned by a local user.
///
/// The player id, once resolved, is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub user_id: Uuid,
    pub login: String,
    pub password: String,
    pub email: String,
    pub player_id: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

//
// ================= Outcome =================
//

/// Structured outcome returned to the intent source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentOutcome {
    pub success: bool,
    pub message: String,
    pub diagnostic_code: String,
    pub balance_state: BalanceState,
    pub saga_id: Option<Uuid>,
    pub local_balance: Option<f64>,
    pub remote_balance: Option<f64>,
}

impl IntentOutcome {
    pub fn rejected(err: &crate::error::BridgeError) -> Self {
        Self {
            success: false,
            message: format!("{}; your balance was not charged", err),
            diagnostic_code: err.diagnostic_code().to_string(),
            balance_state: BalanceState::NotCharged,
            saga_id: None,
            local_balance: None,
            remote_balance: None,
        }
    }
}

//
// ================= Journal =================
//

/// A ledger journal row, recorded when a saga reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub user_id: Uuid,
    pub player_id: Option<String>,
    pub kind: IntentKind,
    pub amount: f64,
    pub status: TxStatus,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionEntry {
    pub fn new(
        user_id: Uuid,
        player_id: Option<String>,
        kind: IntentKind,
        amount: f64,
        status: TxStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            player_id,
            kind,
            amount,
            status,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}
