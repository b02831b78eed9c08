//! gRPC client for an external decision service.

use async_trait::async_trait;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request};
use tracing::{info, trace};

use super::proto::otpguard::v1::{
    decision_service_client::DecisionServiceClient, Conclusion, DecideRequest, DecideResponse,
    ReasonKind as WireReasonKind, RequestContext as WireRequestContext,
};
use crate::config::ExternalConfig;
use crate::error::{OtpGuardError, Result};
use crate::ratelimit::{
    AdapterError, ExternalDecision, ExternalDecisionAdapter, Identifier, ReasonKind,
    RequestContext,
};

/// [`ExternalDecisionAdapter`] backed by `otpguard.v1.DecisionService`.
///
/// The channel connects lazily, so a decision service that is down at
/// startup only degrades evaluation to local-only until it comes back.
#[derive(Clone)]
pub struct GrpcDecisionAdapter {
    client: DecisionServiceClient<Channel>,
    authorization: MetadataValue<Ascii>,
    endpoint: String,
}

impl std::fmt::Debug for GrpcDecisionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcDecisionAdapter")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl GrpcDecisionAdapter {
    /// Create an adapter for `endpoint`, authenticating with `api_key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_lazy(endpoint: &str, api_key: &str, connect_timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| OtpGuardError::Config(format!("invalid external.endpoint '{}': {}", endpoint, e)))?
            .connect_timeout(connect_timeout)
            .connect_lazy();

        let authorization = format!("Bearer {}", api_key)
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| OtpGuardError::Config("external.api_key contains invalid characters".to_string()))?;

        info!(endpoint = %endpoint, "Configured external decision service");

        Ok(Self {
            client: DecisionServiceClient::new(channel),
            authorization,
            endpoint: endpoint.to_string(),
        })
    }

    /// Build the adapter described by `config`, or `None` if no endpoint is set.
    pub fn from_config(config: &ExternalConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref().filter(|_| config.is_enabled()) else {
            return Ok(None);
        };
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            OtpGuardError::Config("external.api_key is required when external.endpoint is set".to_string())
        })?;

        Self::connect_lazy(
            endpoint,
            api_key,
            Duration::from_millis(config.connect_timeout_ms),
        )
        .map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExternalDecisionAdapter for GrpcDecisionAdapter {
    async fn decide(
        &self,
        identifier: &Identifier,
        context: &RequestContext,
    ) -> std::result::Result<ExternalDecision, AdapterError> {
        let mut wire_context = WireRequestContext::from(context);
        // The service keys its limits on the address unless told otherwise.
        wire_context
            .characteristics
            .entry("email".to_string())
            .or_insert_with(|| identifier.email().to_string());

        let mut request = Request::new(DecideRequest {
            identifier: identifier.key(),
            context: Some(wire_context),
        });
        request
            .metadata_mut()
            .insert("authorization", self.authorization.clone());

        trace!(identifier = %identifier, endpoint = %self.endpoint, "Requesting external decision");

        let mut client = self.client.clone();
        let response = client.decide(request).await.map_err(|status| match status.code() {
            Code::Unavailable => AdapterError::Unavailable(status.message().to_string()),
            _ => AdapterError::Transport(status.to_string()),
        })?;

        from_wire(response.into_inner())
    }

    fn name(&self) -> &str {
        "grpc"
    }
}

/// Convert a wire response into a decision.
fn from_wire(response: DecideResponse) -> std::result::Result<ExternalDecision, AdapterError> {
    let mut decision = match response.conclusion() {
        Conclusion::Allow => ExternalDecision::allow(),
        Conclusion::Deny => ExternalDecision::deny(match response.reason() {
            WireReasonKind::RateLimit => ReasonKind::RateLimit,
            WireReasonKind::Bot => ReasonKind::BotSuspected,
            WireReasonKind::Other | WireReasonKind::Unspecified => ReasonKind::Other,
        }),
        Conclusion::Unspecified => {
            return Err(AdapterError::InvalidResponse(
                "missing conclusion".to_string(),
            ))
        }
    };

    if response.retry_after_seconds > 0 {
        decision = decision.with_retry_after(response.retry_after_seconds);
    }
    if !response.id.is_empty() {
        decision = decision.with_id(response.id);
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_allow() {
        let decision = from_wire(DecideResponse {
            conclusion: Conclusion::Allow as i32,
            reason: WireReasonKind::Unspecified as i32,
            retry_after_seconds: 0,
            id: "dec-42".to_string(),
        })
        .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.retry_after_secs, None);
        assert_eq!(decision.id.as_deref(), Some("dec-42"));
    }

    #[test]
    fn test_from_wire_deny_maps_reason() {
        let decision = from_wire(DecideResponse {
            conclusion: Conclusion::Deny as i32,
            reason: WireReasonKind::Bot as i32,
            retry_after_seconds: 120,
            id: String::new(),
        })
        .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(ReasonKind::BotSuspected));
        assert_eq!(decision.retry_after_secs, Some(120));
        assert_eq!(decision.id, None);
    }

    #[test]
    fn test_from_wire_rejects_missing_conclusion() {
        let err = from_wire(DecideResponse::default()).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_from_config_disabled() {
        let adapter = GrpcDecisionAdapter::from_config(&ExternalConfig::default()).unwrap();
        assert!(adapter.is_none());
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_endpoint() {
        let config = ExternalConfig {
            endpoint: Some("not a uri".to_string()),
            api_key: Some("key".to_string()),
            ..ExternalConfig::default()
        };
        assert!(GrpcDecisionAdapter::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_error() {
        let adapter = GrpcDecisionAdapter::connect_lazy(
            "http://127.0.0.1:1",
            "key",
            Duration::from_millis(200),
        )
        .unwrap();
        let result = adapter
            .decide(&Identifier::otp("a@x.com"), &RequestContext::new())
            .await;
        assert!(result.is_err());
    }
}
