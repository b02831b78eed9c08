//! OtpGuard service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::otpguard::v1::{
    otp_guard_server::OtpGuard, CheckRequest, CheckResponse, ResetRequest, ResetResponse,
    StatsRequest, StatsResponse,
};
use super::to_timestamp;

use crate::ratelimit::{Identifier, OtpRateLimiter, Purpose, RequestContext};

/// Implementation of the OtpGuard gRPC interface.
pub struct OtpGuardServiceImpl {
    /// The rate limiter instance
    limiter: Arc<OtpRateLimiter>,
}

impl OtpGuardServiceImpl {
    /// Create a new OtpGuardServiceImpl with the given rate limiter.
    pub fn new(limiter: Arc<OtpRateLimiter>) -> Self {
        Self { limiter }
    }
}

/// Build the identifier a request refers to. An empty purpose means OTP.
fn identifier(purpose: &str, email: &str) -> Result<Identifier, Status> {
    let purpose = if purpose.trim().is_empty() {
        Purpose::Otp
    } else {
        purpose.parse::<Purpose>().map_err(|e| {
            warn!(purpose = %purpose, "Received request with unknown purpose");
            Status::invalid_argument(e.to_string())
        })?
    };

    Identifier::parse(purpose, email).map_err(|e| {
        warn!("Received request with empty email");
        Status::invalid_argument(e.to_string())
    })
}

#[tonic::async_trait]
impl OtpGuard for OtpGuardServiceImpl {
    /// Decide whether a code may be sent to the requested address.
    #[instrument(
        skip(self, request),
        fields(
            purpose = %request.get_ref().purpose,
            has_context = request.get_ref().context.is_some()
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();
        let identifier = identifier(&req.purpose, &req.email)?;
        let context = req.context.map(RequestContext::try_from).transpose()?;

        let decision = self.limiter.is_allowed(&identifier, context.as_ref()).await;

        let external_decision = match &decision.external {
            Some(external) => serde_json::to_string(external)
                .map_err(|e| Status::internal(format!("failed to encode external decision: {}", e)))?,
            None => String::new(),
        };

        debug!(
            identifier = %identifier,
            allowed = decision.allowed,
            retry_after_secs = decision.retry_after_secs,
            "Rate limit check complete"
        );

        Ok(Response::new(CheckResponse {
            allowed: decision.allowed,
            retry_after_seconds: decision.retry_after_secs,
            message: decision.message.unwrap_or_default(),
            remaining: decision.remaining,
            reason: decision.reason.map(|r| r.to_string()).unwrap_or_default(),
            external_decision,
        }))
    }

    #[instrument(skip(self, request), fields(purpose = %request.get_ref().purpose))]
    async fn get_stats(
        &self,
        request: Request<StatsRequest>,
    ) -> Result<Response<StatsResponse>, Status> {
        let req = request.into_inner();
        let identifier = identifier(&req.purpose, &req.email)?;

        let stats = self.limiter.stats(&identifier);
        let wait = self.limiter.time_until_next_request(&identifier);

        Ok(Response::new(StatsResponse {
            count: stats.count,
            remaining: stats.remaining,
            last_request_at: stats.last_request_at.map(to_timestamp),
            next_allowed_at: stats.next_allowed_at.map(to_timestamp),
            millis_until_next_request: wait.as_millis() as u64,
        }))
    }

    #[instrument(skip(self, request), fields(purpose = %request.get_ref().purpose))]
    async fn reset(
        &self,
        request: Request<ResetRequest>,
    ) -> Result<Response<ResetResponse>, Status> {
        let req = request.into_inner();
        let identifier = identifier(&req.purpose, &req.email)?;

        let removed = self.limiter.reset(&identifier);
        Ok(Response::new(ResetResponse { removed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn service() -> OtpGuardServiceImpl {
        let limiter = OtpRateLimiter::default().with_clock(Arc::new(ManualClock::at_epoch()));
        OtpGuardServiceImpl::new(Arc::new(limiter))
    }

    fn check_request(purpose: &str, email: &str) -> Request<CheckRequest> {
        Request::new(CheckRequest {
            purpose: purpose.to_string(),
            email: email.to_string(),
            context: None,
        })
    }

    #[tokio::test]
    async fn test_check_allows_then_cools_down() {
        let service = service();

        let first = service.check(check_request("", "a@x.com")).await.unwrap().into_inner();
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert!(first.reason.is_empty());

        let second = service.check(check_request("otp", "A@X.com")).await.unwrap().into_inner();
        assert!(!second.allowed);
        assert_eq!(second.reason, "cooldown");
        assert_eq!(second.retry_after_seconds, 60);
        assert!(!second.message.is_empty());
    }

    #[tokio::test]
    async fn test_check_rejects_empty_email() {
        let status = service().check(check_request("otp", "  ")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_check_rejects_unknown_purpose() {
        let status = service().check(check_request("signup", "a@x.com")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let service = service();
        service.check(check_request("login", "a@x.com")).await.unwrap();

        let stats = service
            .get_stats(Request::new(StatsRequest {
                purpose: "login".to_string(),
                email: "a@x.com".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.remaining, 4);
        assert_eq!(stats.last_request_at.map(|t| t.seconds), Some(0));
        assert_eq!(stats.next_allowed_at.map(|t| t.seconds), Some(60));
        assert_eq!(stats.millis_until_next_request, 60_000);

        // Purposes do not share state.
        let otp_stats = service
            .get_stats(Request::new(StatsRequest {
                purpose: "otp".to_string(),
                email: "a@x.com".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(otp_stats.count, 0);

        let reset = service
            .reset(Request::new(ResetRequest {
                purpose: "login".to_string(),
                email: "a@x.com".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reset.removed);
    }
}
