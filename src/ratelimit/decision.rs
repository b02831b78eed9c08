//! Admission decisions and the request context they are made for.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Why an external decision service refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    RateLimit,
    BotSuspected,
    Other,
}

impl ReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonKind::RateLimit => "rate_limit",
            ReasonKind::BotSuspected => "bot_suspected",
            ReasonKind::Other => "other",
        }
    }
}

/// Verdict returned by an external decision service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDecision {
    pub allowed: bool,
    /// Set when the request was denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonKind>,
    /// Suggested wait before retrying, if the service gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Service-side decision id, for correlating with its logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ExternalDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_secs: None,
            id: None,
        }
    }

    pub fn deny(reason: ReasonKind) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_secs: None,
            id: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Too soon after the previous admitted request
    Cooldown,
    /// The window's quota is used up
    QuotaExceeded,
    /// Refused upstream by the external decision service
    External(ReasonKind),
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::Cooldown => f.write_str("cooldown"),
            DenialReason::QuotaExceeded => f.write_str("quota_exceeded"),
            DenialReason::External(kind) => write!(f, "external:{}", kind.as_str()),
        }
    }
}

/// Caller-supplied details about the inbound request, forwarded to the
/// external decision service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Extra key/value pairs the decision service keys its limits on
    #[serde(default)]
    pub characteristics: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_characteristic(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.characteristics.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one admission evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Quota left in the current window after this evaluation
    pub remaining: u32,
    /// Whole seconds to wait before retrying; zero when allowed
    pub retry_after_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    /// User-facing explanation of a denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The external service's verdict, when it took part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalDecision>,
}

impl RateLimitDecision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_secs: 0,
            reason: None,
            message: None,
            external: None,
        }
    }

    pub fn cooldown(retry_after_secs: u64, remaining: u32) -> Self {
        Self::deny(
            DenialReason::Cooldown,
            retry_after_secs,
            remaining,
            format!(
                "Please wait {} before requesting another code",
                describe_wait(retry_after_secs)
            ),
        )
    }

    pub fn quota_exceeded(retry_after_secs: u64) -> Self {
        Self::deny(
            DenialReason::QuotaExceeded,
            retry_after_secs,
            0,
            format!(
                "Too many code requests. Try again in {}",
                describe_wait(retry_after_secs)
            ),
        )
    }

    /// Denial issued by the external decision service.
    pub fn external_denied(decision: ExternalDecision, retry_after_secs: u64) -> Self {
        let kind = decision.reason.unwrap_or(ReasonKind::Other);
        let message = match kind {
            ReasonKind::RateLimit => format!(
                "Too many code requests. Try again in {}",
                describe_wait(retry_after_secs)
            ),
            ReasonKind::BotSuspected => {
                "This request looks automated and was blocked".to_string()
            }
            ReasonKind::Other => format!(
                "Request refused. Try again in {}",
                describe_wait(retry_after_secs)
            ),
        };
        let mut denied = Self::deny(DenialReason::External(kind), retry_after_secs, 0, message);
        denied.external = Some(decision);
        denied
    }

    fn deny(reason: DenialReason, retry_after_secs: u64, remaining: u32, message: String) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after_secs,
            reason: Some(reason),
            message: Some(message),
            external: None,
        }
    }

    /// Attach the external verdict that preceded a local decision.
    pub fn with_external(mut self, external: Option<ExternalDecision>) -> Self {
        self.external = external;
        self
    }
}

/// Render a wait in the largest whole unit that does not understate it.
fn describe_wait(secs: u64) -> String {
    match secs {
        1 => "1 second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        s => {
            let minutes = s.div_ceil(60);
            if minutes == 1 {
                "1 minute".to_string()
            } else {
                format!("{} minutes", minutes)
            }
        }
    }
}

/// Whole seconds covering `delta`, rounded up. Negative spans are zero.
pub(crate) fn ceil_secs(delta: chrono::Duration) -> u64 {
    match delta.num_nanoseconds() {
        Some(nanos) => (nanos.max(0) as u64).div_ceil(1_000_000_000),
        None if delta > chrono::Duration::zero() => delta.num_seconds().max(0) as u64 + 1,
        None => 0,
    }
}
