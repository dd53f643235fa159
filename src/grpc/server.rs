//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::config::TransportConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::AdmissionController;
use crate::transport::GrpcRateLimitLayer;

/// gRPC server for the admission service.
///
/// `Check` is skipped by the rate limit layer through the default skip
/// methods; the admin methods are limited like any other caller.
pub struct GrpcServer {
    addr: SocketAddr,
    admission: Arc<AdmissionController>,
    layer: GrpcRateLimitLayer,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        admission: Arc<AdmissionController>,
        transport: &TransportConfig,
    ) -> Result<Self> {
        let layer = GrpcRateLimitLayer::new(admission.clone(), transport)?;
        Ok(Self {
            addr,
            admission,
            layer,
        })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.admission);

        info!(addr = %self.addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .layer(self.layer)
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                FloodgateError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::FloodgateConfig;
    use crate::grpc::proto::admission_service_client::AdmissionServiceClient;
    use crate::grpc::proto::{CheckRequest, Code};
    use crate::ratelimit::DegradationController;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serve_and_check() {
        let config = FloodgateConfig::default();
        let admission = Arc::new(
            AdmissionController::new(
                &config,
                Arc::new(MemoryStore::new()),
                Arc::new(DegradationController::from_config(&config.degradation)),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );

        let addr: SocketAddr = "127.0.0.1:18081".parse().unwrap();
        let server = GrpcServer::new(addr, admission, &config.transport).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut client = None;
        for _ in 0..50 {
            match AdmissionServiceClient::connect(format!("http://{}", addr)).await {
                Ok(c) => {
                    client = Some(c);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("server did not start");

        let response = client
            .check(CheckRequest {
                user_id: "alice".to_string(),
                remote_ip: String::new(),
                endpoint: "/orders".to_string(),
                hits: 1,
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.code(), Code::Ok);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
