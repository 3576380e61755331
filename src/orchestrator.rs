//! Saga orchestrator for financial intents
//!
//! Sequences local ledger mutations with remote account operations in a
//! fixed step order per intent kind, compensating on partial failure.
//! Validation happens before any mutation; once the first mutating step
//! completes, the saga runs to a terminal state even if the caller goes
//! away. Reconciliation cases are flagged with full operation context
//! and are never auto-retried.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, FundsSide, Result};
use crate::ledger::LocalLedger;
use crate::models::{
    BalanceState, FinancialIntent, IntentKind, IntentOutcome, LedgerOp, RemoteAccount,
    TransactionEntry, TxStatus,
};
use crate::remote::RemoteAccounts;
use crate::saga::{
    run_saga, FailurePolicy, SagaContext, SagaOutcome, SagaRecord, SagaState, SagaStep,
    StepEffect, UserGate,
};
use crate::store::AccountStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tolerance when comparing remote balances fetched around a mutation.
const BALANCE_EPSILON: f64 = 0.001;

const MIN_LOGIN_LEN: usize = 3;
const MAX_LOGIN_LEN: usize = 30;

//
// ================= Archive =================
//

/// A saga that ended with balances known to have diverged.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationCase {
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub player_id: Option<String>,
    pub kind: IntentKind,
    pub amount: f64,
    pub failed_step: &'static str,
    pub compensation_step: &'static str,
    pub detail: String,
    pub flagged_at: DateTime<Utc>,
}

/// Terminal saga records plus the manual-review queue.
pub struct SagaArchive {
    records: RwLock<HashMap<Uuid, SagaRecord>>,
    review_queue: RwLock<Vec<ReconciliationCase>>,
}

impl SagaArchive {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            review_queue: RwLock::new(Vec::new()),
        }
    }

    pub async fn archive(&self, record: SagaRecord) {
        let mut records = self.records.write().await;
        records.insert(record.saga_id, record);
    }

    pub async fn get(&self, saga_id: Uuid) -> Option<SagaRecord> {
        let records = self.records.read().await;
        records.get(&saga_id).cloned()
    }

    pub async fn flag_for_review(&self, case: ReconciliationCase) {
        let mut queue = self.review_queue.write().await;
        queue.push(case);
    }

    /// Cases awaiting manual operator action.
    pub async fn pending_reviews(&self) -> Vec<ReconciliationCase> {
        let queue = self.review_queue.read().await;
        queue.clone()
    }
}

impl Default for SagaArchive {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Steps =================
//

struct DebitLocal {
    ledger: Arc<dyn LocalLedger>,
    user: Uuid,
    amount: f64,
}

#[async_trait]
impl SagaStep for DebitLocal {
    fn name(&self) -> &'static str {
        "debit_local"
    }

    fn state_on_success(&self) -> Option<SagaState> {
        Some(SagaState::LocalReserved)
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let balance = self
            .ledger
            .update_balance(self.user, self.amount, LedgerOp::Subtract)
            .await?;
        ctx.local_balance = Some(balance);
        Ok(StepEffect::Mutated)
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> Result<()> {
        let balance = self
            .ledger
            .update_balance(self.user, self.amount, LedgerOp::Add)
            .await?;
        ctx.local_balance = Some(balance);
        Ok(())
    }
}

struct CreditLocal {
    ledger: Arc<dyn LocalLedger>,
    user: Uuid,
    amount: f64,
}

#[async_trait]
impl SagaStep for CreditLocal {
    fn name(&self) -> &'static str {
        "credit_local"
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let balance = self
            .ledger
            .update_balance(self.user, self.amount, LedgerOp::Add)
            .await?;
        ctx.local_balance = Some(balance);
        Ok(StepEffect::Mutated)
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> Result<()> {
        let balance = self
            .ledger
            .update_balance(self.user, self.amount, LedgerOp::Subtract)
            .await?;
        ctx.local_balance = Some(balance);
        Ok(())
    }
}

/// Pre-flight check that the remote account can cover a withdrawal.
/// Insufficient funds abort the saga before any mutation.
struct VerifyRemoteFunds {
    remote: Arc<dyn RemoteAccounts>,
    player: String,
    amount: f64,
}

#[async_trait]
impl SagaStep for VerifyRemoteFunds {
    fn name(&self) -> &'static str {
        "verify_remote_funds"
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let balance = self.remote.balance(&self.player).await?;
        ctx.remote_balance_before = Some(balance);
        if balance < self.amount {
            return Err(BridgeError::InsufficientFunds {
                side: FundsSide::Remote,
                detail: format!(
                    "remote balance {} is below requested {}",
                    balance, self.amount
                ),
            });
        }
        Ok(StepEffect::Validated)
    }

    async fn compensate(&self, _ctx: &mut SagaContext) -> Result<()> {
        Ok(())
    }
}

/// Deposit into a remote account, with unknown-outcome verification:
/// a timed-out call is resolved by re-fetching the authoritative balance
/// and comparing against the pre-call capture, never blindly retried.
struct RemoteDeposit {
    remote: Arc<dyn RemoteAccounts>,
    step_name: &'static str,
    policy: FailurePolicy,
    state: Option<SagaState>,
    /// Fixed target, or resolved from the account created earlier in
    /// this saga.
    player: Option<String>,
    user: Uuid,
    amount: f64,
}

impl RemoteDeposit {
    fn to_player(remote: Arc<dyn RemoteAccounts>, player: String, user: Uuid, amount: f64) -> Self {
        Self {
            remote,
            step_name: "remote_deposit",
            policy: FailurePolicy::Compensate,
            state: Some(SagaState::RemoteApplied),
            player: Some(player),
            user,
            amount,
        }
    }

    /// Opening deposit of a creation saga. The account already exists and
    /// cannot be undone cheaply, so failure keeps what has been applied.
    fn opening(remote: Arc<dyn RemoteAccounts>, user: Uuid, amount: f64) -> Self {
        Self {
            remote,
            step_name: "opening_deposit",
            policy: FailurePolicy::AcceptPartial,
            state: None,
            player: None,
            user,
            amount,
        }
    }
}

#[async_trait]
impl SagaStep for RemoteDeposit {
    fn name(&self) -> &'static str {
        self.step_name
    }

    fn state_on_success(&self) -> Option<SagaState> {
        self.state
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let player = resolve_player(self.player.as_deref(), ctx)?;
        let before = self.remote.balance(&player).await?;
        ctx.remote_balance_before = Some(before);

        match self.remote.deposit(&player, self.amount).await {
            Ok(()) => {
                ctx.remote_balance = Some(before + self.amount);
                Ok(StepEffect::Mutated)
            }
            Err(cause @ BridgeError::OutcomeUnknown(_)) => {
                let landed = verify_applied(
                    self.remote.as_ref(),
                    &player,
                    before,
                    self.amount,
                    self.user,
                    self.step_name,
                )
                .await?;
                if landed {
                    warn!(
                        player_id = %player,
                        amount = self.amount,
                        "deposit outcome was unknown but balance confirms it landed"
                    );
                    ctx.remote_balance = Some(before + self.amount);
                    Ok(StepEffect::Mutated)
                } else {
                    Err(cause)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> Result<()> {
        let player = resolve_player(self.player.as_deref(), ctx)?;
        warn!(player_id = %player, amount = self.amount, "withdrawing compensated deposit");
        self.remote.withdraw(&player, self.amount).await
    }
}

/// Withdraw from a remote account. Compensation is a single re-deposit
/// of the same amount; if that also fails the saga escalates to manual
/// reconciliation.
struct RemoteWithdraw {
    remote: Arc<dyn RemoteAccounts>,
    player: String,
    user: Uuid,
    amount: f64,
}

#[async_trait]
impl SagaStep for RemoteWithdraw {
    fn name(&self) -> &'static str {
        "remote_withdraw"
    }

    fn state_on_success(&self) -> Option<SagaState> {
        Some(SagaState::RemoteApplied)
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let before = match ctx.remote_balance_before {
            Some(balance) => balance,
            None => {
                let balance = self.remote.balance(&self.player).await?;
                ctx.remote_balance_before = Some(balance);
                balance
            }
        };

        match self.remote.withdraw(&self.player, self.amount).await {
            Ok(()) => {
                ctx.remote_balance = Some(before - self.amount);
                Ok(StepEffect::Mutated)
            }
            Err(cause @ BridgeError::OutcomeUnknown(_)) => {
                let landed = verify_applied(
                    self.remote.as_ref(),
                    &self.player,
                    before,
                    -self.amount,
                    self.user,
                    "remote_withdraw",
                )
                .await?;
                if landed {
                    warn!(
                        player_id = %self.player,
                        amount = self.amount,
                        "withdrawal outcome was unknown but balance confirms it landed"
                    );
                    ctx.remote_balance = Some(before - self.amount);
                    Ok(StepEffect::Mutated)
                } else {
                    Err(cause)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> Result<()> {
        warn!(
            player_id = %self.player,
            amount = self.amount,
            "re-depositing withdrawn amount"
        );
        let before = ctx.remote_balance;

        match self.remote.deposit(&self.player, self.amount).await {
            Ok(()) => {
                ctx.remote_balance = before.map(|b| b + self.amount);
                Ok(())
            }
            Err(cause @ BridgeError::OutcomeUnknown(_)) => {
                // One verification attempt; the re-deposit itself is
                // never repeated, duplicate application being worse than
                // a flagged review.
                if let Some(before) = before {
                    let landed = verify_applied(
                        self.remote.as_ref(),
                        &self.player,
                        before,
                        self.amount,
                        self.user,
                        "remote_withdraw",
                    )
                    .await?;
                    if landed {
                        ctx.remote_balance = Some(before + self.amount);
                        return Ok(());
                    }
                }
                Err(cause)
            }
            Err(err) => Err(err),
        }
    }
}

/// Create the remote account and persist it immediately, so a later
/// step failure never strands an account the registry does not know.
struct CreateRemote {
    remote: Arc<dyn RemoteAccounts>,
    store: Arc<dyn AccountStore>,
    user: Uuid,
    login: String,
    password: String,
}

#[async_trait]
impl SagaStep for CreateRemote {
    fn name(&self) -> &'static str {
        "create_remote"
    }

    fn state_on_success(&self) -> Option<SagaState> {
        Some(SagaState::RemoteApplied)
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let account = self
            .remote
            .create_account(self.user, &self.login, &self.password)
            .await?;
        self.store.save_account(account.clone()).await?;
        info!(
            user_id = %self.user,
            player_id = %account.player_id,
            "remote account registered"
        );
        ctx.account = Some(account);
        Ok(StepEffect::Mutated)
    }

    async fn compensate(&self, _ctx: &mut SagaContext) -> Result<()> {
        // The platform has no account deletion; the registered account
        // stays and can be funded later.
        warn!(user_id = %self.user, login = %self.login, "created account kept, registration is not reversible");
        Ok(())
    }
}

/// Best-effort cached-balance refresh. Failure is a warning, never a
/// saga failure.
struct CacheBalance {
    remote: Arc<dyn RemoteAccounts>,
    store: Arc<dyn AccountStore>,
    player: Option<String>,
}

#[async_trait]
impl SagaStep for CacheBalance {
    fn name(&self) -> &'static str {
        "refresh_balance"
    }

    async fn apply(&self, ctx: &mut SagaContext) -> Result<StepEffect> {
        let player = match resolve_player(self.player.as_deref(), ctx) {
            Ok(player) => player,
            Err(_) => return Ok(StepEffect::Validated),
        };

        match self.remote.balance(&player).await {
            Ok(balance) => {
                ctx.remote_balance = Some(balance);
                if let Err(err) = self.store.cache_balance(&player, balance).await {
                    warn!(player_id = %player, error = %err, "balance cache write failed");
                }
            }
            Err(err) => {
                warn!(player_id = %player, error = %err, "balance refresh failed");
            }
        }
        Ok(StepEffect::Validated)
    }

    async fn compensate(&self, _ctx: &mut SagaContext) -> Result<()> {
        Ok(())
    }
}

fn resolve_player(fixed: Option<&str>, ctx: &SagaContext) -> Result<String> {
    if let Some(player) = fixed {
        return Ok(player.to_string());
    }
    ctx.account
        .as_ref()
        .map(|a| a.player_id.clone())
        .ok_or_else(|| {
            BridgeError::InvalidTransition("remote step before account resolution".to_string())
        })
}

/// Re-fetch the authoritative balance after an unknown-outcome mutation
/// and decide whether it landed. A failed re-check means the divergence
/// cannot be ruled out, which is itself a reconciliation case.
async fn verify_applied(
    remote: &dyn RemoteAccounts,
    player: &str,
    before: f64,
    delta: f64,
    user: Uuid,
    step: &'static str,
) -> Result<bool> {
    let after = remote
        .balance(player)
        .await
        .map_err(|err| {
            error!(
                user_id = %user,
                player_id = %player,
                amount = delta.abs(),
                step,
                error = %err,
                "balance re-check after unknown outcome failed"
            );
            BridgeError::ReconciliationRequired {
                user_id: user,
                player_id: player.to_string(),
                amount: delta.abs(),
                step,
            }
        })?;
    Ok((after - (before + delta)).abs() < BALANCE_EPSILON)
}

//
// ================= Orchestrator =================
//

#[derive(Clone)]
pub struct BridgeOrchestrator {
    ledger: Arc<dyn LocalLedger>,
    remote: Arc<dyn RemoteAccounts>,
    store: Arc<dyn AccountStore>,
    config: Arc<BridgeConfig>,
    gate: Arc<UserGate>,
    archive: Arc<SagaArchive>,
}

impl BridgeOrchestrator {
    pub fn new(
        ledger: Arc<dyn LocalLedger>,
        remote: Arc<dyn RemoteAccounts>,
        store: Arc<dyn AccountStore>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            ledger,
            remote,
            store,
            config,
            gate: UserGate::new(),
            archive: Arc::new(SagaArchive::new()),
        }
    }

    pub fn archive(&self) -> Arc<SagaArchive> {
        Arc::clone(&self.archive)
    }

    /// Run one financial intent to a terminal state and report where the
    /// user's money ended up.
    pub async fn handle(&self, intent: FinancialIntent) -> IntentOutcome {
        if let Err(err) = self.validate(&intent) {
            warn!(user_id = %intent.user_id, kind = %intent.kind, error = %err, "intent rejected");
            return IntentOutcome::rejected(&err);
        }

        let permit = match self.gate.try_acquire(intent.user_id) {
            Ok(permit) => permit,
            Err(err) => return IntentOutcome::rejected(&err),
        };

        let account = match self.resolve_account(&intent).await {
            Ok(account) => account,
            Err(err) => return IntentOutcome::rejected(&err),
        };

        let steps = match self.build_steps(&intent, account.as_ref()) {
            Ok(steps) => steps,
            Err(err) => return IntentOutcome::rejected(&err),
        };

        let mut record = SagaRecord::new(intent.kind, intent.user_id, intent.amount);
        let saga_id = record.saga_id;
        info!(
            saga_id = %saga_id,
            user_id = %intent.user_id,
            kind = %intent.kind,
            amount = intent.amount,
            "saga started"
        );

        let mut ctx = SagaContext {
            account,
            ..SagaContext::default()
        };

        // Once the first mutating step completes the saga must reach a
        // terminal state even if the caller abandons it, so the body runs
        // in its own task with finalization included: archiving, the
        // journal write and reconciliation flagging happen even when the
        // caller's future is dropped mid-saga. The permit travels with
        // the task.
        let this = self.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let result = run_saga(&mut record, steps, &mut ctx).await;
            this.finish(&intent, record, ctx, result).await
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(saga_id = %saga_id, error = %join_err, "saga task aborted mid-flight");
                IntentOutcome {
                    success: false,
                    message: "operation interrupted mid-flight; balances are pending manual review"
                        .to_string(),
                    diagnostic_code: "saga_task_failed".to_string(),
                    balance_state: BalanceState::PendingReview,
                    saga_id: Some(saga_id),
                    local_balance: None,
                    remote_balance: None,
                }
            }
        }
    }

    fn validate(&self, intent: &FinancialIntent) -> Result<()> {
        match intent.kind {
            IntentKind::Deposit | IntentKind::Withdraw => self.validate_amount(intent.amount),
            IntentKind::CreateAccount => {
                let login = intent.login.as_deref().unwrap_or("");
                if login.len() < MIN_LOGIN_LEN
                    || login.len() > MAX_LOGIN_LEN
                    || login.chars().any(char::is_whitespace)
                {
                    return Err(BridgeError::Validation {
                        field: "login",
                        reason: format!(
                            "login must be {}-{} characters without whitespace",
                            MIN_LOGIN_LEN, MAX_LOGIN_LEN
                        ),
                    });
                }

                let password_len = intent.password.as_deref().unwrap_or("").len();
                if password_len < self.config.min_password_len
                    || password_len > self.config.max_password_len
                {
                    return Err(BridgeError::Validation {
                        field: "password",
                        reason: format!(
                            "password must be {}-{} characters",
                            self.config.min_password_len, self.config.max_password_len
                        ),
                    });
                }

                // Opening deposit is optional; when present it follows the
                // same minimum as any other deposit.
                if intent.amount != 0.0 {
                    self.validate_amount(intent.amount)?;
                }
                Ok(())
            }
        }
    }

    fn validate_amount(&self, amount: f64) -> Result<()> {
        if amount < self.config.min_amount {
            return Err(BridgeError::Validation {
                field: "amount",
                reason: format!(
                    "{} is below the minimum of {}",
                    amount, self.config.min_amount
                ),
            });
        }
        Ok(())
    }

    async fn resolve_account(&self, intent: &FinancialIntent) -> Result<Option<RemoteAccount>> {
        let existing = self.store.account_for_user(intent.user_id).await?;
        match intent.kind {
            IntentKind::CreateAccount => {
                if let Some(account) = existing {
                    return Err(BridgeError::AlreadyExists(format!(
                        "user already owns remote account '{}'",
                        account.login
                    )));
                }
                // The registry may know logins the remote lookup misses
                // (e.g. an account created moments ago, still absent from
                // the statistics feed).
                let login = intent.login.as_deref().unwrap_or("");
                if self.store.login_taken(login).await? {
                    return Err(BridgeError::AlreadyExists(format!(
                        "login '{}' is already registered locally",
                        login
                    )));
                }
                Ok(None)
            }
            IntentKind::Deposit | IntentKind::Withdraw => match existing {
                Some(account) => Ok(Some(account)),
                None => Err(BridgeError::NotFound(
                    "no remote account registered for this user".to_string(),
                )),
            },
        }
    }

    fn build_steps(
        &self,
        intent: &FinancialIntent,
        account: Option<&RemoteAccount>,
    ) -> Result<Vec<Box<dyn SagaStep>>> {
        let user = intent.user_id;
        let amount = intent.amount;

        match intent.kind {
            IntentKind::Deposit => {
                let player = require_player(account)?;
                Ok(vec![
                    Box::new(DebitLocal {
                        ledger: Arc::clone(&self.ledger),
                        user,
                        amount,
                    }),
                    Box::new(RemoteDeposit::to_player(
                        Arc::clone(&self.remote),
                        player.clone(),
                        user,
                        amount,
                    )),
                    Box::new(CacheBalance {
                        remote: Arc::clone(&self.remote),
                        store: Arc::clone(&self.store),
                        player: Some(player),
                    }),
                ])
            }
            IntentKind::Withdraw => {
                let player = require_player(account)?;
                Ok(vec![
                    Box::new(VerifyRemoteFunds {
                        remote: Arc::clone(&self.remote),
                        player: player.clone(),
                        amount,
                    }),
                    Box::new(RemoteWithdraw {
                        remote: Arc::clone(&self.remote),
                        player: player.clone(),
                        user,
                        amount,
                    }),
                    Box::new(CreditLocal {
                        ledger: Arc::clone(&self.ledger),
                        user,
                        amount,
                    }),
                    Box::new(CacheBalance {
                        remote: Arc::clone(&self.remote),
                        store: Arc::clone(&self.store),
                        player: Some(player),
                    }),
                ])
            }
            IntentKind::CreateAccount => {
                let login = intent.login.clone().unwrap_or_default();
                let password = intent.password.clone().unwrap_or_default();

                let mut steps: Vec<Box<dyn SagaStep>> = Vec::new();
                if amount > 0.0 {
                    steps.push(Box::new(DebitLocal {
                        ledger: Arc::clone(&self.ledger),
                        user,
                        amount,
                    }));
                }
                steps.push(Box::new(CreateRemote {
                    remote: Arc::clone(&self.remote),
                    store: Arc::clone(&self.store),
                    user,
                    login,
                    password,
                }));
                if amount > 0.0 {
                    steps.push(Box::new(RemoteDeposit::opening(
                        Arc::clone(&self.remote),
                        user,
                        amount,
                    )));
                }
                steps.push(Box::new(CacheBalance {
                    remote: Arc::clone(&self.remote),
                    store: Arc::clone(&self.store),
                    player: None,
                }));
                Ok(steps)
            }
        }
    }

    async fn finish(
        &self,
        intent: &FinancialIntent,
        record: SagaRecord,
        ctx: SagaContext,
        result: Result<SagaOutcome>,
    ) -> IntentOutcome {
        let saga_id = record.saga_id;
        let player_id = ctx.account.as_ref().map(|a| a.player_id.clone());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                // Only state-machine violations end up here; the saga did
                // not reach a terminal state on its own.
                error!(saga_id = %saga_id, error = %err, "saga aborted on internal error");
                self.archive.archive(record).await;
                self.journal(intent, player_id.clone(), TxStatus::ReconciliationRequired, err.to_string())
                    .await;
                return IntentOutcome {
                    success: false,
                    message: format!("{}; balances are pending manual review", err),
                    diagnostic_code: err.diagnostic_code().to_string(),
                    balance_state: BalanceState::PendingReview,
                    saga_id: Some(saga_id),
                    local_balance: ctx.local_balance,
                    remote_balance: ctx.remote_balance,
                };
            }
        };

        let (success, status, balance_state, message, diagnostic) = match outcome {
            SagaOutcome::Finalized => {
                let message = match intent.kind {
                    IntentKind::Deposit => format!("deposit of {} settled", intent.amount),
                    IntentKind::Withdraw => format!("withdrawal of {} settled", intent.amount),
                    IntentKind::CreateAccount if intent.amount > 0.0 => {
                        format!("account created and funded with {}", intent.amount)
                    }
                    IntentKind::CreateAccount => "account created".to_string(),
                };
                (
                    true,
                    TxStatus::Success,
                    BalanceState::Settled,
                    message,
                    "ok".to_string(),
                )
            }
            SagaOutcome::AbortedClean { failed_step, cause } => (
                false,
                TxStatus::Failed,
                BalanceState::NotCharged,
                format!(
                    "{} failed at {}: {}; your balance was not charged",
                    intent.kind, failed_step, cause
                ),
                cause.diagnostic_code().to_string(),
            ),
            SagaOutcome::Compensated { failed_step, cause } => (
                false,
                TxStatus::Refunded,
                BalanceState::Refunded,
                format!(
                    "{} failed at {}: {}; your balance was refunded in full",
                    intent.kind, failed_step, cause
                ),
                cause.diagnostic_code().to_string(),
            ),
            SagaOutcome::PartiallyApplied { failed_step, cause } => (
                true,
                TxStatus::PartialSuccess,
                BalanceState::PartiallyApplied,
                format!(
                    "account created, but {} failed: {}; the account is usable and can be topped up later",
                    failed_step, cause
                ),
                cause.diagnostic_code().to_string(),
            ),
            SagaOutcome::ReconciliationRequired {
                failed_step,
                compensation_step,
                cause,
            } => {
                error!(
                    saga_id = %saga_id,
                    user_id = %intent.user_id,
                    player_id = player_id.as_deref().unwrap_or("unresolved"),
                    amount = intent.amount,
                    failed_step,
                    compensation_step,
                    error = %cause,
                    "RECONCILIATION REQUIRED: balances have diverged"
                );
                self.archive
                    .flag_for_review(ReconciliationCase {
                        saga_id,
                        user_id: intent.user_id,
                        player_id: player_id.clone(),
                        kind: intent.kind,
                        amount: intent.amount,
                        failed_step,
                        compensation_step,
                        detail: cause.to_string(),
                        flagged_at: Utc::now(),
                    })
                    .await;
                (
                    false,
                    TxStatus::ReconciliationRequired,
                    BalanceState::PendingReview,
                    format!(
                        "{} failed at {} and its compensation at {} also failed; balances are pending manual review",
                        intent.kind, failed_step, compensation_step
                    ),
                    cause.diagnostic_code().to_string(),
                )
            }
        };

        info!(
            saga_id = %saga_id,
            state = ?record.state,
            success,
            "saga finished"
        );

        self.journal(intent, player_id, status, message.clone()).await;
        self.archive.archive(record).await;

        IntentOutcome {
            success,
            message,
            diagnostic_code: diagnostic,
            balance_state,
            saga_id: Some(saga_id),
            local_balance: ctx.local_balance,
            remote_balance: ctx.remote_balance,
        }
    }

    async fn journal(
        &self,
        intent: &FinancialIntent,
        player_id: Option<String>,
        status: TxStatus,
        detail: String,
    ) {
        let entry = TransactionEntry::new(
            intent.user_id,
            player_id,
            intent.kind,
            intent.amount,
            status,
            detail,
        );
        if let Err(err) = self.ledger.record_transaction(entry).await {
            warn!(user_id = %intent.user_id, error = %err, "journal write failed");
        }
    }
}

fn require_player(account: Option<&RemoteAccount>) -> Result<String> {
    account
        .map(|a| a.player_id.clone())
        .ok_or_else(|| {
            BridgeError::NotFound("no remote account registered for this user".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::remote::MockRemote;
    use crate::store::InMemoryAccountStore;

    fn harness() -> (
        Arc<InMemoryLedger>,
        Arc<MockRemote>,
        Arc<InMemoryAccountStore>,
        BridgeOrchestrator,
    ) {
        let ledger = Arc::new(InMemoryLedger::new());
        let remote = Arc::new(MockRemote::new());
        let store = Arc::new(InMemoryAccountStore::new());
        let orchestrator = BridgeOrchestrator::new(
            Arc::clone(&ledger) as Arc<dyn LocalLedger>,
            Arc::clone(&remote) as Arc<dyn RemoteAccounts>,
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::new(BridgeConfig::default()),
        );
        (ledger, remote, store, orchestrator)
    }

    async fn seed_user(
        ledger: &InMemoryLedger,
        remote: &MockRemote,
        store: &InMemoryAccountStore,
        local: f64,
        remote_balance: f64,
    ) -> (Uuid, String) {
        let user = Uuid::new_v4();
        ledger.set_balance(user, local).await;
        let player = remote.seed_account("seeded", remote_balance);
        store
            .save_account(RemoteAccount {
                user_id: user,
                login: "seeded".to_string(),
                password: "hunter2222".to_string(),
                email: "seeded@TSA.com".to_string(),
                player_id: player.clone(),
                status: crate::models::AccountStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        (user, player)
    }

    #[tokio::test]
    async fn test_amount_below_minimum_rejected_before_any_mutation() {
        let (ledger, remote, store, orchestrator) = harness();
        let (user, _) = seed_user(&ledger, &remote, &store, 100.0, 0.0).await;

        let outcome = orchestrator
            .handle(FinancialIntent::deposit(user, 9.99))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostic_code, "validation_error");
        assert_eq!(outcome.balance_state, BalanceState::NotCharged);
        assert_eq!(ledger.balance(user).await.unwrap(), 100.0);
        assert_eq!(remote.deposit_calls(), 0);
    }

    #[tokio::test]
    async fn test_amount_equal_to_minimum_accepted() {
        let (ledger, remote, store, orchestrator) = harness();
        let (user, _) = seed_user(&ledger, &remote, &store, 100.0, 0.0).await;

        let outcome = orchestrator
            .handle(FinancialIntent::deposit(user, 10.0))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.balance_state, BalanceState::Settled);
        assert_eq!(ledger.balance(user).await.unwrap(), 90.0);
    }

    #[tokio::test]
    async fn test_deposit_without_account_rejected() {
        let (_, _, _, orchestrator) = harness();
        let outcome = orchestrator
            .handle(FinancialIntent::deposit(Uuid::new_v4(), 50.0))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.diagnostic_code, "not_found");
    }

    #[tokio::test]
    async fn test_create_account_with_opening_deposit() {
        let (ledger, remote, store, orchestrator) = harness();
        let user = Uuid::new_v4();
        ledger.set_balance(user, 100.0).await;

        let outcome = orchestrator
            .handle(FinancialIntent::create_account(
                user,
                "freshlogin".to_string(),
                "hunter2222".to_string(),
                40.0,
            ))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.balance_state, BalanceState::Settled);
        assert_eq!(ledger.balance(user).await.unwrap(), 60.0);

        let account = store.account_for_user(user).await.unwrap().unwrap();
        assert_eq!(remote.balance_of(&account.player_id), Some(40.0));
        assert_eq!(outcome.remote_balance, Some(40.0));
    }

    #[tokio::test]
    async fn test_create_account_opening_deposit_failure_is_partial() {
        let (ledger, remote, store, orchestrator) = harness();
        let user = Uuid::new_v4();
        ledger.set_balance(user, 100.0).await;
        remote.fail_next_deposits(1);

        let outcome = orchestrator
            .handle(FinancialIntent::create_account(
                user,
                "freshlogin".to_string(),
                "hunter2222".to_string(),
                40.0,
            ))
            .await;

        // The account survives; the ledger entry is partial, not refunded.
        assert!(outcome.success);
        assert_eq!(outcome.balance_state, BalanceState::PartiallyApplied);
        assert!(store.account_for_user(user).await.unwrap().is_some());
        assert_eq!(ledger.balance(user).await.unwrap(), 60.0);

        let journal = ledger.journal_for_user(user).await;
        assert_eq!(journal.last().unwrap().status, TxStatus::PartialSuccess);
    }

    #[tokio::test]
    async fn test_create_account_password_length_enforced() {
        let (_, _, _, orchestrator) = harness();
        let user = Uuid::new_v4();

        let outcome = orchestrator
            .handle(FinancialIntent::create_account(
                user,
                "freshlogin".to_string(),
                "short".to_string(),
                0.0,
            ))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostic_code, "validation_error");
    }

    #[tokio::test]
    async fn test_create_account_rejected_when_login_registered_locally() {
        let (ledger, _, store, orchestrator) = harness();

        // Registry knows the login even though the remote platform does
        // not (it belongs to a different local user).
        store
            .save_account(RemoteAccount {
                user_id: Uuid::new_v4(),
                login: "localonly".to_string(),
                password: "hunter2222".to_string(),
                email: "localonly@TSA.com".to_string(),
                player_id: "P999001".to_string(),
                status: crate::models::AccountStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let user = Uuid::new_v4();
        ledger.set_balance(user, 100.0).await;

        let outcome = orchestrator
            .handle(FinancialIntent::create_account(
                user,
                "localonly".to_string(),
                "hunter2222".to_string(),
                0.0,
            ))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostic_code, "already_exists");
        assert!(store.account_for_user(user).await.unwrap().is_none());
        assert_eq!(ledger.balance(user).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_duplicate_create_account_rejected() {
        let (ledger, remote, store, orchestrator) = harness();
        let (user, _) = seed_user(&ledger, &remote, &store, 100.0, 0.0).await;

        let outcome = orchestrator
            .handle(FinancialIntent::create_account(
                user,
                "another".to_string(),
                "hunter2222".to_string(),
                0.0,
            ))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.diagnostic_code, "already_exists");
    }

    #[tokio::test]
    async fn test_unknown_deposit_outcome_resolved_by_balance_recheck() {
        let (ledger, remote, store, orchestrator) = harness();
        let (user, player) = seed_user(&ledger, &remote, &store, 100.0, 10.0).await;
        remote.unknown_next_deposits(1);

        let outcome = orchestrator
            .handle(FinancialIntent::deposit(user, 50.0))
            .await;

        // The call timed out but the balance re-check shows it landed.
        assert!(outcome.success);
        assert_eq!(outcome.balance_state, BalanceState::Settled);
        assert_eq!(remote.balance_of(&player), Some(60.0));
        assert_eq!(ledger.balance(user).await.unwrap(), 50.0);
        assert_eq!(remote.deposit_calls(), 1);
    }
}
