use custody_bridge::{
    config::BridgeConfig,
    ledger::{InMemoryLedger, LocalLedger},
    models::FinancialIntent,
    orchestrator::BridgeOrchestrator,
    remote::{MockRemote, RemoteAccounts},
    store::{AccountStore, InMemoryAccountStore},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Custody Bridge demo starting (mock remote platform)");

    // Create components
    let ledger = Arc::new(InMemoryLedger::new());
    let remote = Arc::new(MockRemote::new());
    let store = Arc::new(InMemoryAccountStore::new());
    let config = Arc::new(BridgeConfig::default());

    let orchestrator = BridgeOrchestrator::new(
        Arc::clone(&ledger) as Arc<dyn LocalLedger>,
        Arc::clone(&remote) as Arc<dyn RemoteAccounts>,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        config,
    );

    // Seed a local balance and walk one user through the full flow.
    let user = Uuid::new_v4();
    ledger.set_balance(user, 200.0).await;

    let created = orchestrator
        .handle(FinancialIntent::create_account(
            user,
            "demo_player".to_string(),
            "hunter2222".to_string(),
            50.0,
        ))
        .await;
    info!(
        success = created.success,
        balance_state = %created.balance_state,
        "create account: {}",
        created.message
    );

    let deposited = orchestrator
        .handle(FinancialIntent::deposit(user, 30.0))
        .await;
    info!(
        success = deposited.success,
        local = ?deposited.local_balance,
        remote = ?deposited.remote_balance,
        "deposit: {}",
        deposited.message
    );

    let withdrawn = orchestrator
        .handle(FinancialIntent::withdraw(user, 60.0))
        .await;
    info!(
        success = withdrawn.success,
        local = ?withdrawn.local_balance,
        remote = ?withdrawn.remote_balance,
        "withdraw: {}",
        withdrawn.message
    );

    info!("demo complete");
    Ok(())
}
