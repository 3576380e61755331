use custody_bridge::{
    api::start_server,
    config::BridgeConfig,
    executor::RequestExecutor,
    ledger::{InMemoryLedger, LocalLedger},
    orchestrator::BridgeOrchestrator,
    remote::{RemoteAccountClient, RemoteAccounts},
    session::{HttpAuthenticator, SessionManager},
    store::{AccountStore, InMemoryAccountStore},
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = BridgeConfig::from_env();
    config.validate()?;
    let config = Arc::new(config);

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Custody Bridge - API Server");
    info!("Port: {}", api_port);
    info!("Partner origin: {}", config.origin);

    // One HTTP client with a shared cookie jar carries the agent session.
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .timeout(config.request_timeout)
        .build()?;

    let authenticator = HttpAuthenticator::new(client.clone(), Arc::clone(&config));
    let session = Arc::new(SessionManager::new(
        Box::new(authenticator),
        Arc::clone(&config),
    ));
    let executor = RequestExecutor::new(client, session, Arc::clone(&config));

    let store = Arc::new(InMemoryAccountStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let remote = Arc::new(RemoteAccountClient::new(
        executor,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        config.parent_id.clone(),
        config.min_amount,
    ));

    let orchestrator = Arc::new(BridgeOrchestrator::new(
        ledger as Arc<dyn LocalLedger>,
        remote as Arc<dyn RemoteAccounts>,
        store as Arc<dyn AccountStore>,
        config,
    ));

    info!("Orchestrator initialized");
    info!("Starting API server...");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
