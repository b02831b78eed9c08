//! gRPC surface: the OtpGuard service and the external decision client.

mod client;
mod server;
mod service;

pub use client::GrpcDecisionAdapter;
pub use server::GrpcServer;
pub use service::OtpGuardServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod otpguard {
        pub mod v1 {
            tonic::include_proto!("otpguard.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::otpguard::v1::{
    decision_service_client::DecisionServiceClient,
    decision_service_server::{DecisionService, DecisionServiceServer},
    otp_guard_client::OtpGuardClient,
    otp_guard_server::OtpGuardServer,
    CheckRequest, CheckResponse, DecideRequest, DecideResponse,
};

use chrono::{DateTime, Utc};
use tonic::Status;

use crate::ratelimit::RequestContext;
use proto::otpguard::v1 as pb;

impl From<&RequestContext> for pb::RequestContext {
    fn from(ctx: &RequestContext) -> Self {
        pb::RequestContext {
            ip: ctx.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            user_agent: ctx.user_agent.clone().unwrap_or_default(),
            fingerprint: ctx.fingerprint.clone().unwrap_or_default(),
            characteristics: ctx.characteristics.clone().into_iter().collect(),
        }
    }
}

impl TryFrom<pb::RequestContext> for RequestContext {
    type Error = Status;

    fn try_from(ctx: pb::RequestContext) -> Result<Self, Self::Error> {
        let ip = match ctx.ip.trim() {
            "" => None,
            raw => Some(
                raw.parse()
                    .map_err(|_| Status::invalid_argument(format!("invalid ip address '{}'", raw)))?,
            ),
        };

        Ok(RequestContext {
            ip,
            user_agent: non_empty(ctx.user_agent),
            fingerprint: non_empty(ctx.fingerprint),
            characteristics: ctx.characteristics.into_iter().collect(),
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub(crate) fn to_timestamp(instant: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: instant.timestamp(),
        nanos: instant.timestamp_subsec_nanos() as i32,
    }
}
