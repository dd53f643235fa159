//! Admission decision service implementation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::admission_service_server::AdmissionService;
use super::proto::{
    BanRequest, BanResponse, CheckRequest, CheckResponse, Code, LiftBanRequest, LiftBanResponse,
};
use crate::ratelimit::{AdmissionController, Identifier, RequestContext, Transport};

/// Exposes the admission controller to services that cannot host the
/// in-process middleware.
pub struct AdmissionServiceImpl {
    admission: Arc<AdmissionController>,
}

impl AdmissionServiceImpl {
    pub fn new(admission: Arc<AdmissionController>) -> Self {
        Self { admission }
    }
}

fn to_proto_duration(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn parse_identifier(raw: &str) -> Result<Identifier, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid identifier: {}", raw)))
}

fn store_status(e: crate::store::StoreError) -> Status {
    warn!(error = %e, "Ban store operation failed");
    Status::unavailable("rate limiter store unavailable")
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    /// Decide whether a request described by the caller may proceed.
    #[instrument(
        skip(self, request),
        fields(
            endpoint = %request.get_ref().endpoint,
            authenticated = !request.get_ref().user_id.is_empty(),
            hits = request.get_ref().hits
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        if req.endpoint.is_empty() {
            warn!("Received check request with empty endpoint");
            return Err(Status::invalid_argument("endpoint is required"));
        }

        let ip = if req.remote_ip.is_empty() {
            None
        } else {
            Some(req.remote_ip.parse::<IpAddr>().map_err(|_| {
                Status::invalid_argument(format!("invalid remote_ip: {}", req.remote_ip))
            })?)
        };

        let ctx = RequestContext::new(req.endpoint, Transport::Grpc)
            .with_ip(ip)
            .with_user(Some(req.user_id))
            .with_hits(u64::from(req.hits));

        let decision = self.admission.admit(&ctx).await;

        let code = match decision.deny_reason() {
            None => Code::Ok,
            Some(reason) if reason.is_rate_limited() => Code::OverLimit,
            Some(_) => Code::Unavailable,
        };
        debug!(code = ?code, identifier = %ctx.identity(), "Admission decision made");

        let quota = decision.quota;
        Ok(Response::new(CheckResponse {
            code: code.into(),
            limit: quota.map_or(0, |q| q.limit),
            remaining: quota.map_or(0, |q| q.remaining),
            retry_after: decision.retry_after.map(to_proto_duration),
            reset_after: quota.map(|q| to_proto_duration(q.reset_after)),
        }))
    }

    #[instrument(skip(self, request), fields(identifier = %request.get_ref().identifier))]
    async fn ban(&self, request: Request<BanRequest>) -> Result<Response<BanResponse>, Status> {
        let req = request.into_inner();
        let id = parse_identifier(&req.identifier)?;
        if !id.is_ban_subject() {
            return Err(Status::invalid_argument(format!(
                "only ip and user identifiers can be banned: {}",
                id
            )));
        }
        let duration = (req.duration_secs > 0).then(|| Duration::from_secs(req.duration_secs));
        let reason = if req.reason.is_empty() {
            "manual"
        } else {
            req.reason.as_str()
        };

        let record = self
            .admission
            .ban(&id, duration, reason)
            .await
            .map_err(store_status)?;

        info!(identifier = %id, "Ban applied via gRPC");
        Ok(Response::new(BanResponse {
            expires_at_unix: record.expires_at.map_or(0, |at| at.timestamp()),
        }))
    }

    #[instrument(skip(self, request), fields(identifier = %request.get_ref().identifier))]
    async fn lift_ban(
        &self,
        request: Request<LiftBanRequest>,
    ) -> Result<Response<LiftBanResponse>, Status> {
        let id = parse_identifier(&request.get_ref().identifier)?;
        let lifted = self.admission.lift_ban(&id).await.map_err(store_status)?;
        Ok(Response::new(LiftBanResponse { lifted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FloodgateConfig;
    use crate::ratelimit::{DegradationController, LimitProfile};
    use crate::store::MemoryStore;

    fn service() -> AdmissionServiceImpl {
        let clock = ManualClock::default();
        let mut config = FloodgateConfig::default();
        config.rate_limiting.limits.anonymous = LimitProfile {
            per_second: Some(2),
            per_minute: None,
            per_hour: None,
            per_day: None,
            burst: 0,
        };
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let degradation = Arc::new(DegradationController::from_config(&config.degradation));
        let admission =
            AdmissionController::new(&config, store, degradation, Arc::new(clock)).unwrap();
        AdmissionServiceImpl::new(Arc::new(admission))
    }

    fn check(ip: &str, user: &str) -> Request<CheckRequest> {
        Request::new(CheckRequest {
            user_id: user.to_string(),
            remote_ip: ip.to_string(),
            endpoint: "/api/v1/items".to_string(),
            hits: 0,
        })
    }

    #[tokio::test]
    async fn test_empty_endpoint_rejected() {
        let request = Request::new(CheckRequest {
            endpoint: String::new(),
            ..CheckRequest::default()
        });

        let result = service().check(request).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_bad_ip_rejected() {
        let result = service().check(check("not-an-ip", "")).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_check_reports_over_limit() {
        let service = service();

        for remaining in [1, 0] {
            let response = service.check(check("203.0.113.4", "")).await.unwrap().into_inner();
            assert_eq!(response.code(), Code::Ok);
            assert_eq!(response.limit, 2);
            assert_eq!(response.remaining, remaining);
        }

        let response = service.check(check("203.0.113.4", "")).await.unwrap().into_inner();
        assert_eq!(response.code(), Code::OverLimit);
        assert!(response.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_ban_and_lift() {
        let service = service();

        let response = service
            .ban(Request::new(BanRequest {
                identifier: "user:mallory".to_string(),
                duration_secs: 0,
                reason: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.expires_at_unix, 0);

        let response = service.check(check("", "mallory")).await.unwrap().into_inner();
        assert_eq!(response.code(), Code::OverLimit);

        let lifted = service
            .lift_ban(Request::new(LiftBanRequest {
                identifier: "user:mallory".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(lifted.lifted);

        let response = service.check(check("", "mallory")).await.unwrap().into_inner();
        assert_eq!(response.code(), Code::Ok);
    }

    #[tokio::test]
    async fn test_ban_rejects_unenforced_classes() {
        let service = service();

        for identifier in ["global:*", "endpoint:/login|ip:10.0.0.9"] {
            let result = service
                .ban(Request::new(BanRequest {
                    identifier: identifier.to_string(),
                    duration_secs: 0,
                    reason: String::new(),
                }))
                .await;
            assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
        }
        assert!(service.admission.list_bans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ban_rejects_bad_identifier() {
        let result = service()
            .ban(Request::new(BanRequest {
                identifier: "mallory".to_string(),
                duration_secs: 60,
                reason: "spam".to_string(),
            }))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }
}
