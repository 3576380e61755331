//! Local registry of resolved remote accounts
//!
//! Persists the RemoteAccount a creation saga resolves, plus a cached
//! remote balance. One account per local user; the cached balance is
//! advisory only and is refreshed best-effort by sagas.

use crate::error::Result;
use crate::models::RemoteAccount;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn account_for_user(&self, user: Uuid) -> Result<Option<RemoteAccount>>;
    async fn login_taken(&self, login: &str) -> Result<bool>;
    async fn email_taken(&self, email: &str) -> Result<bool>;
    async fn save_account(&self, account: RemoteAccount) -> Result<()>;
    async fn cache_balance(&self, player_id: &str, balance: f64) -> Result<()>;
    async fn cached_balance(&self, player_id: &str) -> Result<Option<f64>>;
}

/// In-memory account registry for development and tests.
pub struct InMemoryAccountStore {
    accounts: Arc<RwLock<HashMap<Uuid, RemoteAccount>>>,
    balances: Arc<RwLock<HashMap<String, f64>>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            balances: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn account_for_user(&self, user: Uuid) -> Result<Option<RemoteAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(&user).cloned())
    }

    async fn login_taken(&self, login: &str) -> Result<bool> {
        let accounts = self.accounts.read().await;
        Ok(accounts.values().any(|a| a.login == login))
    }

    async fn email_taken(&self, email: &str) -> Result<bool> {
        let accounts = self.accounts.read().await;
        Ok(accounts.values().any(|a| a.email == email))
    }

    async fn save_account(&self, account: RemoteAccount) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.user_id, account);
        Ok(())
    }

    async fn cache_balance(&self, player_id: &str, balance: f64) -> Result<()> {
        let mut balances = self.balances.write().await;
        balances.insert(player_id.to_string(), balance);
        Ok(())
    }

    async fn cached_balance(&self, player_id: &str) -> Result<Option<f64>> {
        let balances = self.balances.read().await;
        Ok(balances.get(player_id).copied())
    }
}
