//! Local ledger collaborator boundary
//!
//! The bridge only calls this interface; the durable storage engine
//! behind it is external. The in-memory implementation backs development
//! and tests.

use crate::error::{BridgeError, FundsSide, Result};
use crate::models::{LedgerOp, TransactionEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait LocalLedger: Send + Sync {
    async fn balance(&self, user: Uuid) -> Result<f64>;

    /// Apply a balance mutation atomically. `Subtract` must fail rather
    /// than let the balance go negative. Returns the resulting balance.
    async fn update_balance(&self, user: Uuid, amount: f64, op: LedgerOp) -> Result<f64>;

    async fn record_transaction(&self, entry: TransactionEntry) -> Result<()>;
}

/// In-memory ledger for development and tests.
pub struct InMemoryLedger {
    balances: Arc<RwLock<HashMap<Uuid, f64>>>,
    journal: Arc<RwLock<Vec<TransactionEntry>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            balances: Arc::new(RwLock::new(HashMap::new())),
            journal: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn set_balance(&self, user: Uuid, amount: f64) {
        let mut balances = self.balances.write().await;
        balances.insert(user, amount);
    }

    pub async fn journal_for_user(&self, user: Uuid) -> Vec<TransactionEntry> {
        let journal = self.journal.read().await;
        journal
            .iter()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalLedger for InMemoryLedger {
    async fn balance(&self, user: Uuid) -> Result<f64> {
        let balances = self.balances.read().await;
        Ok(balances.get(&user).copied().unwrap_or(0.0))
    }

    async fn update_balance(&self, user: Uuid, amount: f64, op: LedgerOp) -> Result<f64> {
        let mut balances = self.balances.write().await;
        let current = balances.entry(user).or_insert(0.0);

        let next = match op {
            LedgerOp::Add => *current + amount,
            LedgerOp::Subtract => {
                if *current < amount {
                    return Err(BridgeError::InsufficientFunds {
                        side: FundsSide::Local,
                        detail: format!("balance {} is below requested {}", current, amount),
                    });
                }
                *current - amount
            }
            LedgerOp::Set => amount,
        };

        *current = next;
        Ok(next)
    }

    async fn record_transaction(&self, entry: TransactionEntry) -> Result<()> {
        let mut journal = self.journal.write().await;
        journal.push(entry);
        Ok(())
    }
}
