//! otpguard - admission control for one-time passcode issuance
//!
//! This crate decides whether a verification code may be emailed to an
//! address right now. It combines a per-address window quota, a minimum
//! interval between sends, an optional external decision service and a
//! background sweep that bounds memory, and serves the result over gRPC.

pub mod config;
pub mod error;
pub mod grpc;
pub mod issuance;
pub mod ratelimit;
