//! Tower middleware for HTTP services such as axum routers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use http::{Request, StatusCode};
use serde_json::json;
use tower::{Layer, Service};

use super::{ceil_secs, quota_headers, LayerState};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::metrics::AdmissionMetrics;
use crate::ratelimit::{AdmissionController, Decision, DenyReason, RequestContext, Transport};

/// Applies admission control to every request not matched by a skip path.
///
/// The peer address comes from axum's [`ConnectInfo`], so the router must be
/// served with `into_make_service_with_connect_info::<SocketAddr>()`.
#[derive(Clone)]
pub struct HttpRateLimitLayer {
    state: Arc<LayerState>,
}

impl HttpRateLimitLayer {
    pub fn new(admission: Arc<AdmissionController>, config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            state: Arc::new(LayerState::new(
                admission,
                config,
                config.skip_paths.clone(),
            )?),
        })
    }
}

impl<S> Layer<S> for HttpRateLimitLayer {
    type Service = HttpRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpRateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HttpRateLimitService<S> {
    inner: S,
    state: Arc<LayerState>,
}

impl<S, B> Service<Request<B>> for HttpRateLimitService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        if self.state.skip.matches(req.uri().path()) {
            AdmissionMetrics.bypassed("skip");
            return Box::pin(self.inner.call(req));
        }

        // The clone that was driven to readiness is the one we must call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();

        Box::pin(async move {
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip());
            let ctx = RequestContext::new(req.uri().path(), Transport::Http)
                .with_ip(state.resolver.client_ip(peer, req.headers()))
                .with_user(state.resolver.user(peer, req.headers(), req.extensions()));

            let decision = state.admission.admit(&ctx).await;
            if !decision.is_allowed() {
                return Ok(deny_response(&decision));
            }

            let mut response = inner.call(req).await?;
            response.headers_mut().extend(quota_headers(&decision));
            Ok(response)
        })
    }
}

/// 429 for rate limits and bans, 503 for shedding and store outages.
fn deny_response(decision: &Decision) -> Response<Body> {
    let Some(reason) = decision.deny_reason() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let (status, message) = if reason.is_rate_limited() {
        (StatusCode::TOO_MANY_REQUESTS, "Too many requests")
    } else if reason == DenyReason::Overloaded {
        (StatusCode::SERVICE_UNAVAILABLE, "Service is shedding load")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable")
    };

    let body = Json(json!({
        "error": reason.client_code(),
        "message": message,
        "retry_after": decision.retry_after.map(ceil_secs),
    }));

    let mut response = (status, body).into_response();
    response.headers_mut().extend(quota_headers(decision));
    response
}
