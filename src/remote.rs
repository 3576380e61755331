//! Remote account operations against the partner platform
//!
//! Account creation, deposits, withdrawals, balance lookup and existence
//! checks, all funneled through the resilient executor. The wire format
//! follows the partner's agent API: sign-in and player mutations answer
//! `{"result": true}` on success, statistics lookups answer paginated
//! record lists, and balance adjustments are a signed amount.

use crate::config::Endpoint;
use crate::error::{BridgeError, FundsSide, Result};
use crate::executor::{ApplyState, CallSpec, OperationOutcome, RequestExecutor};
use crate::models::{AccountStatus, RemoteAccount};
use crate::store::AccountStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const EMAIL_DOMAIN: &str = "TSA.com";
const STATISTICS_PAGE_SIZE: u32 = 100;
const MAX_LOOKUP_PAGES: u32 = 10;
const MAX_EMAIL_SUFFIX: u32 = 20;
const CURRENCY: &str = "NSP";
/// Platform constant for agent-to-player transfers.
const MONEY_STATUS: u32 = 5;

//
// ================= Wire types =================
//

#[derive(Debug, Deserialize)]
struct StatisticsResponse {
    #[serde(default)]
    result: Option<StatisticsResult>,
}

#[derive(Debug, Default, Deserialize)]
struct StatisticsResult {
    #[serde(default)]
    records: Vec<PlayerRecord>,
}

#[derive(Debug, Deserialize)]
struct PlayerRecord {
    #[serde(default)]
    username: Option<String>,
    #[serde(rename = "playerId", default)]
    player_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    result: Vec<BalanceRecord>,
}

#[derive(Debug, Deserialize)]
struct BalanceRecord {
    #[serde(default)]
    balance: f64,
}

//
// ================= Trait seam =================
//

/// Remote account operations, as the saga orchestrator sees them.
///
/// Mutating operations surface `OutcomeUnknown` when their effect could
/// not be verified; callers must re-check authoritative state before
/// retrying or compensating.
#[async_trait]
pub trait RemoteAccounts: Send + Sync {
    async fn create_account(
        &self,
        user_id: Uuid,
        login: &str,
        password: &str,
    ) -> Result<RemoteAccount>;
    async fn deposit(&self, player_id: &str, amount: f64) -> Result<()>;
    async fn withdraw(&self, player_id: &str, amount: f64) -> Result<()>;
    async fn balance(&self, player_id: &str) -> Result<f64>;
    async fn exists(&self, login: &str) -> Result<bool>;
    async fn email_exists(&self, email: &str) -> Result<bool>;
}

//
// ================= HTTP implementation =================
//

pub struct RemoteAccountClient {
    executor: RequestExecutor,
    store: Arc<dyn AccountStore>,
    parent_id: String,
    min_amount: f64,
}

impl RemoteAccountClient {
    pub fn new(
        executor: RequestExecutor,
        store: Arc<dyn AccountStore>,
        parent_id: String,
        min_amount: f64,
    ) -> Self {
        Self {
            executor,
            store,
            parent_id,
            min_amount,
        }
    }

    fn require_min_amount(&self, amount: f64) -> Result<()> {
        if amount < self.min_amount {
            return Err(BridgeError::Validation {
                field: "amount",
                reason: format!("{} is below the minimum of {}", amount, self.min_amount),
            });
        }
        Ok(())
    }

    /// Find an email no one holds yet, checking the local registry and the
    /// remote platform, appending a numeric suffix until unique.
    async fn derive_unique_email(&self, login: &str) -> Result<String> {
        for suffix in 0..=MAX_EMAIL_SUFFIX {
            let candidate = derive_email(login, suffix);
            if self.store.email_taken(&candidate).await? {
                continue;
            }
            if self.email_exists(&candidate).await? {
                continue;
            }
            return Ok(candidate);
        }
        Err(BridgeError::Validation {
            field: "login",
            reason: format!("could not derive a unique email for '{}'", login),
        })
    }

    /// The creation ack carries no player id; resolve it with a paginated
    /// lookup filtered by login. Absence is an error, not assumed success.
    async fn resolve_player_id(&self, login: &str) -> Result<String> {
        let mut page = 1;
        loop {
            let records = self.statistics_page(json!({ "login": login }), page).await?;
            let count = records.len();

            for record in records {
                if record.username.as_deref() == Some(login) {
                    if let Some(player_id) = record.player_id {
                        debug!(login, player_id = %player_id, "resolved player id");
                        return Ok(player_id);
                    }
                }
            }

            if !more_pages(count, page) {
                return Err(BridgeError::NotFound(format!(
                    "player '{}' not present in statistics after creation",
                    login
                )));
            }
            page += 1;
        }
    }

    /// Paginate a statistics lookup until a record matches, a short page
    /// ends the data, or the page cap is hit.
    async fn statistics_match(
        &self,
        filter: serde_json::Value,
        matches: impl Fn(&PlayerRecord) -> bool,
    ) -> Result<bool> {
        let mut page = 1;
        loop {
            let records = self.statistics_page(filter.clone(), page).await?;
            let count = records.len();
            if records.iter().any(&matches) {
                return Ok(true);
            }
            if !more_pages(count, page) {
                return Ok(false);
            }
            page += 1;
        }
    }

    async fn statistics_page(
        &self,
        filter: serde_json::Value,
        page: u32,
    ) -> Result<Vec<PlayerRecord>> {
        let outcome = self
            .executor
            .execute(CallSpec::read(
                Endpoint::Statistics,
                json!({
                    "page": page,
                    "pageSize": STATISTICS_PAGE_SIZE,
                    "filter": filter,
                }),
            ))
            .await?;
        let body = require_success(&outcome, "statistics lookup")?;

        let parsed: StatisticsResponse = serde_json::from_str(body)?;
        Ok(parsed.result.unwrap_or_default().records)
    }
}

#[async_trait]
impl RemoteAccounts for RemoteAccountClient {
    async fn create_account(
        &self,
        user_id: Uuid,
        login: &str,
        password: &str,
    ) -> Result<RemoteAccount> {
        if self.exists(login).await? {
            return Err(BridgeError::AlreadyExists(format!(
                "login '{}' is taken on the remote platform",
                login
            )));
        }

        let email = self.derive_unique_email(login).await?;
        info!(login, email = %email, "registering remote account");

        let outcome = self
            .executor
            .execute(CallSpec::mutating(
                Endpoint::RegisterPlayer,
                json!({
                    "player": {
                        "email": email,
                        "password": password,
                        "parentId": self.parent_id,
                        "login": login,
                    }
                }),
            ))
            .await?;
        let body = require_success(&outcome, "account registration")?;
        parse_ack(body, "account registration")?;

        let player_id = self.resolve_player_id(login).await?;
        info!(login, player_id = %player_id, "remote account created");

        Ok(RemoteAccount {
            user_id,
            login: login.to_string(),
            password: password.to_string(),
            email,
            player_id,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        })
    }

    async fn deposit(&self, player_id: &str, amount: f64) -> Result<()> {
        self.require_min_amount(amount)?;

        info!(player_id, amount, "remote deposit");
        let outcome = self
            .executor
            .execute(CallSpec::mutating(
                Endpoint::Deposit,
                adjust_payload(player_id, amount),
            ))
            .await?;
        let body = require_success(&outcome, "deposit")?;
        parse_ack(body, "deposit")
    }

    async fn withdraw(&self, player_id: &str, amount: f64) -> Result<()> {
        self.require_min_amount(amount)?;

        // Cached balances may be stale; re-fetch the authoritative one
        // immediately before submission.
        let balance = self.balance(player_id).await?;
        if balance < amount {
            return Err(BridgeError::InsufficientFunds {
                side: FundsSide::Remote,
                detail: format!("balance {} is below requested {}", balance, amount),
            });
        }

        info!(player_id, amount, "remote withdrawal");
        let outcome = self
            .executor
            .execute(CallSpec::mutating(
                Endpoint::Withdraw,
                adjust_payload(player_id, -amount),
            ))
            .await?;
        let body = require_success(&outcome, "withdrawal")?;
        parse_ack(body, "withdrawal")
    }

    async fn balance(&self, player_id: &str) -> Result<f64> {
        let outcome = self
            .executor
            .execute(CallSpec::read(
                Endpoint::Balance,
                json!({ "playerId": player_id }),
            ))
            .await?;
        let body = require_success(&outcome, "balance lookup")?;
        parse_balance(body, player_id)
    }

    async fn exists(&self, login: &str) -> Result<bool> {
        self.statistics_match(json!({ "login": login }), |r| {
            r.username.as_deref() == Some(login)
        })
        .await
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        self.statistics_match(json!({ "email": email }), |r| {
            r.email.as_deref() == Some(email)
        })
        .await
    }
}

/// Whether another statistics page may hold more records: the previous
/// page was full and the page cap has not been reached.
fn more_pages(count: usize, page: u32) -> bool {
    count >= STATISTICS_PAGE_SIZE as usize && page < MAX_LOOKUP_PAGES
}

fn adjust_payload(player_id: &str, signed_amount: f64) -> serde_json::Value {
    json!({
        "amount": signed_amount,
        "comment": null,
        "playerId": player_id,
        "currencyCode": CURRENCY,
        "currency": CURRENCY,
        "moneyStatus": MONEY_STATUS,
    })
}

/// Convert a non-success executor outcome into the matching error.
fn require_success<'a>(outcome: &'a OperationOutcome, what: &str) -> Result<&'a str> {
    if outcome.success {
        return Ok(&outcome.body);
    }
    match outcome.apply_state {
        ApplyState::Unknown => Err(BridgeError::OutcomeUnknown(format!(
            "{} timed out in flight",
            what
        ))),
        _ => Err(BridgeError::Network(format!(
            "{} rejected with status {:?}: {}",
            what,
            outcome.status,
            truncate(&outcome.body, 200)
        ))),
    }
}

/// Interpret a `{"result": ...}` acknowledgement body.
fn parse_ack(body: &str, what: &str) -> Result<()> {
    let parsed: serde_json::Value = serde_json::from_str(body)?;
    if parsed.get("result") == Some(&serde_json::Value::Bool(true)) {
        return Ok(());
    }

    let message = extract_error_message(&parsed)
        .unwrap_or_else(|| format!("{} rejected with an unexpected response", what));
    let lowered = message.to_lowercase();

    if lowered.contains("already exists") {
        Err(BridgeError::AlreadyExists(message))
    } else if lowered.contains("insufficient") {
        Err(BridgeError::InsufficientFunds {
            side: FundsSide::Remote,
            detail: message,
        })
    } else if lowered.contains("not found") {
        Err(BridgeError::NotFound(message))
    } else {
        Err(BridgeError::Network(format!("{}: {}", what, message)))
    }
}

/// The platform nests error text in several places; check them in order.
fn extract_error_message(parsed: &serde_json::Value) -> Option<String> {
    if let Some(error) = parsed.get("error").and_then(|v| v.as_str()) {
        return Some(error.to_string());
    }
    if let Some(message) = parsed.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    parsed
        .get("notification")
        .and_then(|v| v.as_array())
        .and_then(|list| list.first())
        .and_then(|n| n.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// A balance response must contain exactly one record. Anything else is a
/// hard failure; it is never silently reported as a zero balance.
fn parse_balance(body: &str, player_id: &str) -> Result<f64> {
    let parsed: BalanceResponse = serde_json::from_str(body)?;
    match parsed.result.as_slice() {
        [record] => Ok(record.balance),
        [] => Err(BridgeError::NotFound(format!(
            "no balance record for player {}",
            player_id
        ))),
        records => Err(BridgeError::Validation {
            field: "balance",
            reason: format!(
                "expected exactly one balance record for player {}, got {}",
                player_id,
                records.len()
            ),
        }),
    }
}

/// Deterministic email derivation: `login@domain`, then `login2@domain`,
/// `login3@domain`, ... for disambiguation.
fn derive_email(login: &str, suffix: u32) -> String {
    if suffix == 0 {
        format!("{}@{}", login, EMAIL_DOMAIN)
    } else {
        format!("{}{}@{}", login, suffix + 1, EMAIL_DOMAIN)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

//
// ================= Mock implementation =================
//

/// In-memory remote platform for development and testing.
///
/// Keeps the orchestrator runnable without network access and supports
/// scripted failure injection for saga scenarios.
pub struct MockRemote {
    state: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    accounts: Vec<MockAccount>,
    next_id: u64,
    fail_deposits: u32,
    fail_withdrawals: u32,
    unknown_deposits: u32,
    deposit_calls: u32,
    withdraw_calls: u32,
}

struct MockAccount {
    login: String,
    email: String,
    player_id: String,
    balance: f64,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(MockState::default()),
        }
    }

    /// Seed an existing account, returning its player id.
    pub fn seed_account(&self, login: &str, balance: f64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let player_id = format!("P{:06}", state.next_id);
        state.accounts.push(MockAccount {
            login: login.to_string(),
            email: format!("{}@{}", login, EMAIL_DOMAIN),
            player_id: player_id.clone(),
            balance,
        });
        player_id
    }

    /// Fail the next `n` deposit calls with a network-class error.
    pub fn fail_next_deposits(&self, n: u32) {
        self.state.lock().unwrap().fail_deposits = n;
    }

    /// Fail the next `n` withdrawal calls with a network-class error.
    pub fn fail_next_withdrawals(&self, n: u32) {
        self.state.lock().unwrap().fail_withdrawals = n;
    }

    /// Make the next `n` deposits apply remotely but report an unknown
    /// outcome, as a timed-out mutating call would.
    pub fn unknown_next_deposits(&self, n: u32) {
        self.state.lock().unwrap().unknown_deposits = n;
    }

    pub fn deposit_calls(&self) -> u32 {
        self.state.lock().unwrap().deposit_calls
    }

    pub fn withdraw_calls(&self) -> u32 {
        self.state.lock().unwrap().withdraw_calls
    }

    pub fn balance_of(&self, player_id: &str) -> Option<f64> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .iter()
            .find(|a| a.player_id == player_id)
            .map(|a| a.balance)
    }
}

#[async_trait]
impl RemoteAccounts for MockRemote {
    async fn create_account(
        &self,
        user_id: Uuid,
        login: &str,
        password: &str,
    ) -> Result<RemoteAccount> {
        let mut state = self.state.lock().unwrap();
        if state.accounts.iter().any(|a| a.login == login) {
            return Err(BridgeError::AlreadyExists(format!(
                "login '{}' is taken",
                login
            )));
        }
        state.next_id += 1;
        let player_id = format!("P{:06}", state.next_id);
        let email = format!("{}@{}", login, EMAIL_DOMAIN);
        state.accounts.push(MockAccount {
            login: login.to_string(),
            email: email.clone(),
            player_id: player_id.clone(),
            balance: 0.0,
        });
        Ok(RemoteAccount {
            user_id,
            login: login.to_string(),
            password: password.to_string(),
            email,
            player_id,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        })
    }

    async fn deposit(&self, player_id: &str, amount: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deposit_calls += 1;
        if state.fail_deposits > 0 {
            state.fail_deposits -= 1;
            return Err(BridgeError::Network("deposit rejected".to_string()));
        }
        let unknown = if state.unknown_deposits > 0 {
            state.unknown_deposits -= 1;
            true
        } else {
            false
        };
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.player_id == player_id)
            .ok_or_else(|| BridgeError::NotFound(format!("player {}", player_id)))?;
        account.balance += amount;
        if unknown {
            return Err(BridgeError::OutcomeUnknown(
                "deposit timed out in flight".to_string(),
            ));
        }
        Ok(())
    }

    async fn withdraw(&self, player_id: &str, amount: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.withdraw_calls += 1;
        if state.fail_withdrawals > 0 {
            state.fail_withdrawals -= 1;
            return Err(BridgeError::Network("withdrawal rejected".to_string()));
        }
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.player_id == player_id)
            .ok_or_else(|| BridgeError::NotFound(format!("player {}", player_id)))?;
        if account.balance < amount {
            return Err(BridgeError::InsufficientFunds {
                side: FundsSide::Remote,
                detail: format!("balance {} below requested {}", account.balance, amount),
            });
        }
        account.balance -= amount;
        Ok(())
    }

    async fn balance(&self, player_id: &str) -> Result<f64> {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .iter()
            .find(|a| a.player_id == player_id)
            .map(|a| a.balance)
            .ok_or_else(|| BridgeError::NotFound(format!("player {}", player_id)))
    }

    async fn exists(&self, login: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.accounts.iter().any(|a| a.login == login))
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.accounts.iter().any(|a| a.email == email))
    }
}
