//! Floodgate - Rate Limiting and Admission Control
//!
//! This crate decides, per incoming request, whether an HTTP or gRPC call
//! may proceed. Limits are tracked per identity (client IP or authenticated
//! user) across second, minute, hour and day windows, repeat offenders are
//! banned, and limits tighten as system load rises. Counters live in a
//! pluggable store: in process, in Redis, or gossiped across a chitchat mesh.

pub mod admin;
pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod mesh;
pub mod metrics;
pub mod ratelimit;
pub mod store;
pub mod transport;
