//! Verification-code issuance: rate check, render, send with retries.
//!
//! Mail transport is not provided here; callers plug in an [`EmailSender`].

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ratelimit::{Clock, Identifier, OtpRateLimiter, Purpose, RequestContext, SystemClock};

/// Minutes a code stays valid, as stated in the email.
const CODE_VALIDITY_MINUTES: u32 = 10;

/// A rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Delivery failure reported by an [`EmailSender`].
#[derive(Debug, Error)]
#[error("email delivery failed: {0}")]
pub struct SendError(pub String);

/// Outbound mail transport.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), SendError>;
}

/// Why a code was not issued.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: u64 },

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("failed to send verification code after {attempts} attempts: {source}")]
    Delivery {
        attempts: u32,
        #[source]
        source: SendError,
    },
}

/// Retry schedule for delivery. Attempt `n` (1-based) that fails waits
/// `base_delay * 2^n` before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Render the verification email for `code`, dated `sent_at`.
pub fn render_otp_email(app_name: &str, code: &str, email: &str, sent_at: DateTime<Utc>) -> EmailMessage {
    let year = sent_at.year();
    let subject = format!("{} - your verification code", app_name);

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{app} verification</title></head>
<body style="font-family: sans-serif; background-color: #f5f5f5; margin: 0; padding: 24px;">
  <div style="max-width: 600px; margin: 0 auto; background: #ffffff; border-radius: 8px; padding: 32px;">
    <h1 style="margin: 0 0 16px 0;">{app}</h1>
    <p>Use the following code to continue signing in:</p>
    <div style="font-size: 36px; font-weight: 700; letter-spacing: 8px; font-family: monospace; text-align: center; padding: 24px; border: 2px dashed #667eea;">{code}</div>
    <p style="color: #888888;">This code is valid for {minutes} minutes.</p>
    <p style="color: #856404;"><strong>Important:</strong> never share this code. {app} will never ask you for it.</p>
    <p style="color: #666666;">If you did not request this code, you can ignore this email.</p>
    <p style="color: #888888; font-size: 12px;">Sent to <strong>{email}</strong> &middot; &copy; {year} {app}</p>
  </div>
</body>
</html>"#,
        app = app_name,
        code = code,
        email = email,
        minutes = CODE_VALIDITY_MINUTES,
        year = year,
    );

    let text = format!(
        "{app} - email verification\n\n\
         Your verification code: {code}\n\n\
         This code is valid for {minutes} minutes.\n\n\
         Never share this code with anyone.\n\
         If you did not request this code, you can ignore this email.\n\n\
         Sent to {email}\n\n\
         (c) {year} {app}",
        app = app_name,
        code = code,
        email = email,
        minutes = CODE_VALIDITY_MINUTES,
        year = year,
    );

    EmailMessage {
        to: email.to_string(),
        subject,
        html,
        text,
    }
}

/// Issues verification codes, gated by the OTP rate limiter.
pub struct OtpIssuer {
    limiter: Arc<OtpRateLimiter>,
    sender: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    app_name: String,
}

impl OtpIssuer {
    pub fn new(limiter: Arc<OtpRateLimiter>, sender: Arc<dyn EmailSender>, app_name: impl Into<String>) -> Self {
        Self {
            limiter,
            sender,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            app_name: app_name.into(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the rate limit for `email` and, if admitted, send it `code`.
    ///
    /// The rate limit slot is consumed even when delivery ultimately fails.
    pub async fn issue(
        &self,
        email: &str,
        code: &str,
        context: Option<&RequestContext>,
    ) -> Result<(), IssueError> {
        let identifier = Identifier::parse(Purpose::Otp, email)
            .map_err(|_| IssueError::InvalidEmail(email.to_string()))?;

        let decision = self.limiter.is_allowed(&identifier, context).await;
        if !decision.allowed {
            return Err(IssueError::RateLimited {
                message: decision
                    .message
                    .unwrap_or_else(|| "Rate limit exceeded".to_string()),
                retry_after_secs: decision.retry_after_secs,
            });
        }

        let message = render_otp_email(&self.app_name, code, identifier.email(), self.clock.now());
        let attempts = self.retry.attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.sender.send(&message).await {
                Ok(()) => {
                    info!(identifier = %identifier, attempt = attempt, "Verification code sent");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    warn!(identifier = %identifier, attempt = attempt, error = %e, "Giving up on verification code delivery");
                    return Err(IssueError::Delivery { attempts, source: e });
                }
                Err(e) => {
                    let delay = self.retry.delay_after(attempt);
                    debug!(
                        identifier = %identifier,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Verification code delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
