//! gRPC admission decision service.

pub mod proto;
mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Re-export commonly used types
pub use proto::admission_service_client::AdmissionServiceClient;
pub use proto::admission_service_server::AdmissionServiceServer;
pub use proto::{CheckRequest, CheckResponse, Code};
