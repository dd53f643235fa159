use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::routes::{router, AdminState};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::transport::HttpRateLimitLayer;

/// Serves the admin router behind the HTTP rate limit layer.
pub struct AdminServer {
    addr: SocketAddr,
    app: Router,
}

impl AdminServer {
    pub fn new(addr: SocketAddr, state: AdminState, transport: &TransportConfig) -> Result<Self> {
        let limiter = HttpRateLimitLayer::new(state.admission.clone(), transport)?;
        Ok(Self {
            addr,
            app: router(state, limiter),
        })
    }

    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting admin HTTP server");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Admin server failed");
            e.into()
        })
    }
}
