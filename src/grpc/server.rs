//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::otpguard::v1::otp_guard_server::OtpGuardServer;
use super::service::OtpGuardServiceImpl;
use crate::error::{OtpGuardError, Result};
use crate::ratelimit::OtpRateLimiter;

/// gRPC server for the OtpGuard service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<OtpRateLimiter>,
}

impl GrpcServer {
    /// Create a new gRPC server around `limiter`.
    pub fn new(addr: SocketAddr, limiter: Arc<OtpRateLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = OtpGuardServiceImpl::new(self.limiter);

        info!(
            addr = %self.addr,
            "Starting gRPC server for OtpGuard with graceful shutdown"
        );

        Server::builder()
            .add_service(OtpGuardServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                OtpGuardError::Grpc(e)
            })
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// The configured address is ignored; useful when binding to port 0.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = OtpGuardServiceImpl::new(self.limiter);
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting gRPC server for OtpGuard on bound listener");

        Server::builder()
            .add_service(OtpGuardServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                OtpGuardError::Grpc(e)
            })
    }
}
