//! Tower middleware for tonic servers.
//!
//! Denials are returned as trailers-only gRPC responses, so clients see an
//! ordinary status (`RESOURCE_EXHAUSTED` or `UNAVAILABLE`) with the rate
//! limit metadata attached.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response};
use tonic::transport::server::TcpConnectInfo;
use tower::{Layer, Service};

use super::{quota_headers, LayerState};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::metrics::AdmissionMetrics;
use crate::ratelimit::{AdmissionController, Decision, RequestContext, Transport};

const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");

/// Applies admission control to every gRPC method not matched by a skip rule.
///
/// Install with `tonic::transport::Server::builder().layer(..)`.
#[derive(Clone)]
pub struct GrpcRateLimitLayer {
    state: Arc<LayerState>,
}

impl GrpcRateLimitLayer {
    pub fn new(admission: Arc<AdmissionController>, config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            state: Arc::new(LayerState::new(
                admission,
                config,
                config.skip_methods.clone(),
            )?),
        })
    }
}

impl<S> Layer<S> for GrpcRateLimitLayer {
    type Service = GrpcRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcRateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcRateLimitService<S> {
    inner: S,
    state: Arc<LayerState>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcRateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if self.state.skip.matches(req.uri().path()) {
            AdmissionMetrics.bypassed("skip");
            return Box::pin(self.inner.call(req));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();

        Box::pin(async move {
            let peer = req
                .extensions()
                .get::<TcpConnectInfo>()
                .and_then(|info| info.remote_addr())
                .map(|addr| addr.ip());
            let ctx = RequestContext::new(req.uri().path(), Transport::Grpc)
                .with_ip(state.resolver.client_ip(peer, req.headers()))
                .with_user(state.resolver.user(peer, req.headers(), req.extensions()));

            let decision = state.admission.admit(&ctx).await;
            if !decision.is_allowed() {
                return Ok(deny_response(&decision));
            }
            inner.call(req).await
        })
    }
}

/// A trailers-only response carrying the denial status and quota metadata.
fn deny_response<B: Default>(decision: &Decision) -> Response<B> {
    let (code, message) = match decision.deny_reason() {
        Some(reason) if reason.is_rate_limited() => {
            (tonic::Code::ResourceExhausted, reason.client_code())
        }
        Some(reason) => (tonic::Code::Unavailable, reason.client_code()),
        None => (tonic::Code::Internal, "internal"),
    };

    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(GRPC_STATUS, HeaderValue::from(code as i32));
    headers.insert(GRPC_MESSAGE, HeaderValue::from_static(message));
    headers.extend(quota_headers(decision));
    response
}
