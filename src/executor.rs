//! Resilient request executor
//!
//! Wraps every remote call with organic-traffic pacing, per-attempt header
//! rotation, bounded retries and classifier-driven branching. Retry limits
//! live in an explicit decision function over a backoff table, not hidden
//! in recursion, so the branching is independently testable.

use crate::config::{BridgeConfig, Endpoint};
use crate::error::{BridgeError, Result};
use crate::protection::{self, Classification, ProtectionKind};
use crate::session::SessionManager;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether a call changes remote state. Mutating calls are never retried
/// unless the previous attempt provably did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    ReadOnly,
    Mutating,
}

/// What is known about whether a call's effect landed remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Applied,
    NotApplied,
    /// The call timed out after being sent; its effect is unknown.
    /// Callers must re-check authoritative remote state before acting.
    Unknown,
}

/// One remote call to execute.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub endpoint: Endpoint,
    pub payload: serde_json::Value,
    pub kind: CallKind,
}

impl CallSpec {
    pub fn read(endpoint: Endpoint, payload: serde_json::Value) -> Self {
        Self {
            endpoint,
            payload,
            kind: CallKind::ReadOnly,
        }
    }

    pub fn mutating(endpoint: Endpoint, payload: serde_json::Value) -> Self {
        Self {
            endpoint,
            payload,
            kind: CallKind::Mutating,
        }
    }
}

/// Outcome of one executed call, consumed by both the remote operations
/// layer and the saga orchestrator.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub success: bool,
    pub classification: Classification,
    pub retriable: bool,
    pub apply_state: ApplyState,
    pub status: Option<u16>,
    pub body: String,
}

/// Decision for the next step of the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RetryDecision {
    Return,
    RetryAfter(Duration),
    AbortProtection(ProtectionKind),
    Exhausted,
}

/// Pure branching table over a classification and the attempt counter.
pub(crate) fn decide(
    classification: &Classification,
    attempt: u32,
    config: &BridgeConfig,
) -> RetryDecision {
    if classification.is_success() {
        return RetryDecision::Return;
    }

    match classification.kind {
        ProtectionKind::None => RetryDecision::Return,
        ProtectionKind::RateLimited => {
            if attempt + 1 >= config.max_retries {
                RetryDecision::Exhausted
            } else {
                let wait = classification
                    .retry_after
                    .unwrap_or(config.rate_limit_default_wait);
                RetryDecision::RetryAfter(wait)
            }
        }
        ProtectionKind::Captcha
        | ProtectionKind::CloudflareChallenge
        | ProtectionKind::JsChallenge => {
            // Challenges cannot be resolved automatically.
            if attempt + 1 >= config.protection_max_attempts {
                RetryDecision::AbortProtection(classification.kind)
            } else {
                RetryDecision::RetryAfter(backoff_delay(attempt, config))
            }
        }
        ProtectionKind::AccessDenied | ProtectionKind::Unknown => {
            if attempt + 1 >= config.max_retries {
                RetryDecision::Exhausted
            } else {
                RetryDecision::RetryAfter(backoff_delay(attempt, config))
            }
        }
    }
}

/// Exponential backoff: base * 2^attempt, capped.
pub(crate) fn backoff_delay(attempt: u32, config: &BridgeConfig) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    config
        .backoff_base
        .saturating_mul(factor)
        .min(config.backoff_cap)
}

pub struct RequestExecutor {
    client: reqwest::Client,
    session: Arc<SessionManager>,
    config: Arc<BridgeConfig>,
}

impl RequestExecutor {
    pub fn new(
        client: reqwest::Client,
        session: Arc<SessionManager>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            client,
            session,
            config,
        }
    }

    /// Execute one remote call to completion.
    ///
    /// Returns `Ok` with an outcome for ordinary success and failure paths
    /// (including unknown-applied), and `Err` for conditions no caller can
    /// recover from inline (challenge blocks, authentication lockout).
    pub async fn execute(&self, spec: CallSpec) -> Result<OperationOutcome> {
        let mut attempt: u32 = 0;
        let mut relogin_done = false;

        loop {
            self.session.ensure_valid().await?;
            self.pace().await;

            let user_agent = pick_user_agent(&self.config.user_agents);
            debug!(
                endpoint = ?spec.endpoint,
                attempt,
                "sending remote request"
            );

            let sent = self
                .client
                .post(self.config.endpoint_url(spec.endpoint))
                .header(reqwest::header::USER_AGENT, user_agent)
                .json(&spec.payload)
                .timeout(self.config.request_timeout)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    // Timeouts and connection failures never produce a
                    // classified server response. A connection failure
                    // provably never reached the server and may be retried;
                    // a timeout on a mutating call may have applied, so it
                    // is reported unknown rather than retried blind.
                    if e.is_timeout() && spec.kind == CallKind::Mutating {
                        warn!(
                            endpoint = ?spec.endpoint,
                            "mutating call timed out, outcome unknown"
                        );
                        return Ok(OperationOutcome {
                            success: false,
                            classification: protection::classify(0, "", None),
                            retriable: false,
                            apply_state: ApplyState::Unknown,
                            status: None,
                            body: e.to_string(),
                        });
                    }

                    if attempt + 1 >= self.config.max_retries {
                        return Err(BridgeError::Network(format!(
                            "{:?} failed after {} attempts: {}",
                            spec.endpoint,
                            attempt + 1,
                            e
                        )));
                    }

                    let delay = backoff_delay(attempt, &self.config);
                    warn!(
                        endpoint = ?spec.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "network failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let body = response.text().await.unwrap_or_default();

            let classification = protection::classify(status, &body, retry_after.as_deref());

            if classification.authentication {
                if relogin_done {
                    return Err(BridgeError::AuthenticationFailed(format!(
                        "still unauthorized after re-login ({:?})",
                        spec.endpoint
                    )));
                }
                warn!(endpoint = ?spec.endpoint, "authentication-class response, renewing session");
                self.session.invalidate().await;
                relogin_done = true;
                continue;
            }

            match decide(&classification, attempt, &self.config) {
                RetryDecision::Return => {
                    return Ok(OperationOutcome {
                        success: true,
                        classification,
                        retriable: false,
                        apply_state: ApplyState::Applied,
                        status: Some(status),
                        body,
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        endpoint = ?spec.endpoint,
                        kind = %classification.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "remote call blocked, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::AbortProtection(kind) => {
                    return Err(BridgeError::ProtectionBlocked { kind });
                }
                RetryDecision::Exhausted => {
                    // A classified HTTP rejection means the server saw and
                    // refused the call, so it did not apply.
                    return Ok(OperationOutcome {
                        success: false,
                        classification,
                        retriable: false,
                        apply_state: ApplyState::NotApplied,
                        status: Some(status),
                        body,
                    });
                }
            }
        }
    }

    async fn pace(&self) {
        let (min, max) = (
            self.config.pacing_min.as_millis() as u64,
            self.config.pacing_max.as_millis() as u64,
        );
        let delay = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

}

/// Rotate through the configured User-Agent pool; an empty pool falls
/// back to the built-in one instead of panicking.
fn pick_user_agent(pool: &[String]) -> String {
    if pool.is_empty() {
        return crate::config::DEFAULT_USER_AGENTS[0].clone();
    }
    let idx = rand::thread_rng().gen_range(0..pool.len());
    pool[idx].clone()
}
