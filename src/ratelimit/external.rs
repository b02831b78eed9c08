//! External decision adapter trait.
//!
//! An external decision service (edge rate limiter, bot detection) can veto
//! a request before local admission runs. It is strictly additive: when it
//! fails or is slow, evaluation continues with the local policy alone.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::decision::{ExternalDecision, RequestContext};
use super::identifier::Identifier;

/// Failures talking to an external decision service.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("decision service unavailable: {0}")]
    Unavailable(String),

    #[error("decision service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("decision service returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("decision service transport error: {0}")]
    Transport(String),
}

/// Trait for out-of-process admission policies.
#[async_trait]
pub trait ExternalDecisionAdapter: Send + Sync {
    /// Ask the service whether `identifier` may proceed.
    async fn decide(
        &self,
        identifier: &Identifier,
        context: &RequestContext,
    ) -> Result<ExternalDecision, AdapterError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// How the composite limiter treats its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Upper bound on one `decide` call
    pub timeout: Duration,
    /// Retry-after for denials that do not carry one
    pub default_retry_after_secs: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            default_retry_after_secs: 15 * 60,
        }
    }
}
