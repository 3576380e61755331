//! Session manager for the single partner-platform credential
//!
//! Owns authentication state and cookie lifetime. Renewal is a single
//! process-wide critical section: concurrent callers that detect a stale
//! session share the outcome of one login attempt instead of each logging
//! in (prevents cookie thrashing).

use crate::config::{BridgeConfig, Endpoint};
use crate::error::{BridgeError, Result};
use crate::protection::{self, ProtectionKind};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A freshly renewed session is trusted without a probe for this long.
const PROBE_GRACE: Duration = Duration::from_secs(30);

/// Transport used to authenticate and probe the remote platform.
///
/// Split out as a trait so session policy (lockout, TTL, single-flight
/// renewal) is testable without network access.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign_in(&self, username: &str, password: &str) -> Result<()>;
    /// Lightweight call that fails with an authentication-class error
    /// when the current cookie session is no longer valid.
    async fn probe(&self) -> Result<()>;
}

/// Authenticator backed by the shared cookie-jar HTTP client.
pub struct HttpAuthenticator {
    client: reqwest::Client,
    config: Arc<BridgeConfig>,
}

impl HttpAuthenticator {
    pub fn new(client: reqwest::Client, config: Arc<BridgeConfig>) -> Self {
        Self { client, config }
    }

    async fn post_checked(&self, endpoint: Endpoint, payload: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(self.config.endpoint_url(endpoint))
            .json(&payload)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let classification = protection::classify(status, &body, None);

        if classification.authentication {
            return Err(BridgeError::AuthenticationFailed(format!(
                "rejected by {:?} with status {}",
                endpoint, status
            )));
        }
        if classification.kind != ProtectionKind::None {
            return Err(BridgeError::ProtectionBlocked {
                kind: classification.kind,
            });
        }

        // The platform reports sign-in failures inside a 200 body.
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        if parsed.get("result") == Some(&serde_json::Value::Bool(true)) {
            Ok(())
        } else if endpoint == Endpoint::SignIn {
            Err(BridgeError::AuthenticationFailed(
                "sign-in rejected by platform".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn sign_in(&self, username: &str, password: &str) -> Result<()> {
        self.post_checked(
            Endpoint::SignIn,
            json!({ "username": username, "password": password }),
        )
        .await
    }

    async fn probe(&self) -> Result<()> {
        self.post_checked(Endpoint::Statistics, json!({ "page": 1, "pageSize": 1 }))
            .await
    }
}

#[derive(Debug, Default)]
struct SessionState {
    authenticated: bool,
    last_auth: Option<Instant>,
    /// Last successful probe; bounds how often the platform is probed.
    last_verified: Option<Instant>,
    failures: u32,
    last_attempt: Option<Instant>,
}

impl SessionState {
    fn fresh(&self, ttl: Duration) -> bool {
        self.authenticated
            && self
                .last_auth
                .map(|t| t.elapsed() < ttl)
                .unwrap_or(false)
    }
}

/// Owns the single authenticated session. At most one exists at a time;
/// it is mutated only through `login` / `ensure_valid` / `invalidate`.
pub struct SessionManager {
    auth: Box<dyn Authenticator>,
    config: Arc<BridgeConfig>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(auth: Box<dyn Authenticator>, config: Arc<BridgeConfig>) -> Self {
        Self {
            auth,
            config,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Submit the service credential.
    ///
    /// After `login_failure_threshold` consecutive failures within the
    /// lockout window, further attempts are rejected until the window
    /// elapses instead of hammering the sign-in endpoint.
    pub async fn login(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state).await
    }

    async fn login_locked(&self, state: &mut SessionState) -> Result<()> {
        if state.failures >= self.config.login_failure_threshold {
            if let Some(last) = state.last_attempt {
                let elapsed = last.elapsed();
                if elapsed < self.config.login_lockout_window {
                    let remaining = self.config.login_lockout_window - elapsed;
                    warn!(
                        failures = state.failures,
                        remaining_secs = remaining.as_secs(),
                        "login locked out"
                    );
                    return Err(BridgeError::AuthenticationFailed(format!(
                        "too many failed login attempts, locked out for {}s",
                        remaining.as_secs()
                    )));
                }
                // Window elapsed, allow a fresh round of attempts.
                state.failures = 0;
            }
        }

        info!(username = %self.config.agent_username, "signing in to partner platform");
        state.last_attempt = Some(Instant::now());

        match self
            .auth
            .sign_in(&self.config.agent_username, &self.config.agent_password)
            .await
        {
            Ok(()) => {
                state.authenticated = true;
                state.last_auth = Some(Instant::now());
                state.failures = 0;
                info!("partner sign-in successful");
                Ok(())
            }
            Err(e) => {
                state.authenticated = false;
                state.failures += 1;
                warn!(failures = state.failures, error = %e, "partner sign-in failed");
                Err(BridgeError::AuthenticationFailed(e.to_string()))
            }
        }
    }

    /// Make sure a usable session exists, renewing it if needed.
    ///
    /// Holding the state lock across the await makes renewal mutually
    /// exclusive; queued callers find the session already renewed and
    /// return without a second login.
    pub async fn ensure_valid(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.fresh(self.config.session_ttl) {
            // A recent renewal or probe is trusted without another round
            // trip, so at most one probe goes out per grace window.
            let recently_checked = [state.last_auth, state.last_verified]
                .into_iter()
                .flatten()
                .any(|t| t.elapsed() < PROBE_GRACE);
            if recently_checked {
                return Ok(());
            }

            match self.auth.probe().await {
                Ok(()) => {
                    state.last_verified = Some(Instant::now());
                    return Ok(());
                }
                Err(BridgeError::AuthenticationFailed(_)) => {
                    debug!("session probe rejected, re-authenticating");
                    state.authenticated = false;
                }
                Err(e) => return Err(e),
            }
        }

        self.login_locked(&mut state).await
    }

    /// Mark the session invalid so the next caller renews it.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.authenticated = false;
        debug!("session invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockAuthenticator {
        sign_ins: AtomicU32,
        probes: AtomicU32,
        fail_sign_ins: AtomicU32,
        fail_probe: std::sync::atomic::AtomicBool,
    }

    impl MockAuthenticator {
        fn new() -> Self {
            Self {
                sign_ins: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                fail_sign_ins: AtomicU32::new(0),
                fail_probe: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Authenticator for Arc<MockAuthenticator> {
        async fn sign_in(&self, _username: &str, _password: &str) -> Result<()> {
            self.sign_ins.fetch_add(1, Ordering::SeqCst);
            // Simulate network latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_sign_ins.load(Ordering::SeqCst) > 0 {
                self.fail_sign_ins.fetch_sub(1, Ordering::SeqCst);
                return Err(BridgeError::AuthenticationFailed("bad credentials".into()));
            }
            Ok(())
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.fail_probe.load(Ordering::SeqCst) {
                return Err(BridgeError::AuthenticationFailed("stale cookie".into()));
            }
            Ok(())
        }
    }

    fn manager(auth: Arc<MockAuthenticator>) -> Arc<SessionManager> {
        let config = Arc::new(BridgeConfig {
            agent_username: "agent".into(),
            agent_password: "secret".into(),
            parent_id: "1".into(),
            ..BridgeConfig::default()
        });
        Arc::new(SessionManager::new(Box::new(auth), config))
    }

    #[tokio::test]
    async fn test_login_success_resets_failures() {
        let auth = Arc::new(MockAuthenticator::new());
        auth.fail_sign_ins.store(1, Ordering::SeqCst);
        let mgr = manager(auth.clone());

        assert!(mgr.login().await.is_err());
        assert!(mgr.login().await.is_ok());

        let state = mgr.state.lock().await;
        assert_eq!(state.failures, 0);
        assert!(state.authenticated);
    }

    #[tokio::test]
    async fn test_lockout_after_threshold() {
        let auth = Arc::new(MockAuthenticator::new());
        auth.fail_sign_ins.store(10, Ordering::SeqCst);
        let mgr = manager(auth.clone());

        for _ in 0..3 {
            assert!(mgr.login().await.is_err());
        }
        assert_eq!(auth.sign_ins.load(Ordering::SeqCst), 3);

        // Fourth attempt is rejected without touching the transport.
        assert!(mgr.login().await.is_err());
        assert_eq!(auth.sign_ins.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_valid_logs_in_once() {
        let auth = Arc::new(MockAuthenticator::new());
        let mgr = manager(auth.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.ensure_valid().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(auth.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_at_most_once_per_grace_window() {
        let auth = Arc::new(MockAuthenticator::new());
        let mgr = manager(auth.clone());

        assert!(mgr.login().await.is_ok());

        // Age the session past the probe grace so the next check probes.
        {
            let mut state = mgr.state.lock().await;
            state.last_auth = Some(Instant::now() - PROBE_GRACE - Duration::from_secs(1));
        }

        assert!(mgr.ensure_valid().await.is_ok());
        assert!(mgr.ensure_valid().await.is_ok());
        assert!(mgr.ensure_valid().await.is_ok());

        // The first call probed; the rest trusted the fresh probe instead
        // of serializing behind another round trip.
        assert_eq!(auth.probes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_triggers_single_relogin() {
        let auth = Arc::new(MockAuthenticator::new());
        let mgr = manager(auth.clone());

        assert!(mgr.login().await.is_ok());

        // Age the session past the probe grace so ensure_valid probes.
        {
            let mut state = mgr.state.lock().await;
            state.last_auth = Some(Instant::now() - PROBE_GRACE - Duration::from_secs(1));
        }
        auth.fail_probe.store(true, Ordering::SeqCst);

        assert!(mgr.ensure_valid().await.is_ok());
        assert_eq!(auth.sign_ins.load(Ordering::SeqCst), 2);
    }
}
