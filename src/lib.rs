//! Custody Bridge
//!
//! Moves monetary balance between a locally-owned ledger and a remote
//! partner platform reachable only through an unreliable,
//! anti-automation-protected HTTP API:
//! - Classifies protection responses (rate limits, CAPTCHAs, challenges)
//! - Owns the single authenticated agent session and its renewal
//! - Paces, rotates and retries every remote call with bounded backoff
//! - Runs each financial intent as a compensating saga
//! - Escalates diverged balances to a manual reconciliation queue
//!
//! FLOW:
//! INTENT → VALIDATE → SAGA STEPS → (COMPENSATE?) → TERMINAL STATE

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod protection;
pub mod remote;
pub mod saga;
pub mod session;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::BridgeOrchestrator;
pub use protection::{classify, Classification, ProtectionKind};
