//! Admission service implementation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::leases::LeaseTable;
use super::proto::{
    admission_service_server::AdmissionService, check_response::Code, CheckRequest,
    CheckResponse, HeaderValue, InspectKeyRequest, InspectKeyResponse, ReleaseRequest,
    ReleaseResponse, ResetKeyRequest, ResetKeyResponse,
};
use super::proto;
use crate::ratelimit::{Admission, AdmissionGate, AdmissionRequest, Identity, Rejection};

/// Implementation of the `AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl {
    gate: Arc<AdmissionGate>,
    leases: Arc<LeaseTable>,
}

impl AdmissionServiceImpl {
    pub fn new(gate: Arc<AdmissionGate>, leases: Arc<LeaseTable>) -> Self {
        Self { gate, leases }
    }

    fn respond(&self, admission: Admission) -> CheckResponse {
        let response_headers_to_add = admission
            .headers()
            .into_iter()
            .map(|(key, value)| HeaderValue {
                key: key.to_string(),
                value,
            })
            .collect();

        if let Some(rejection) = admission.rejection() {
            return CheckResponse {
                code: Code::OverLimit.into(),
                status_code: u32::from(Rejection::STATUS),
                response_headers_to_add,
                raw_body: rejection.to_json(),
                lease_id: String::new(),
                rule: rejection.rule.clone(),
                retry_after: rejection
                    .retry_after_secs
                    .map(|secs| wire_duration(Duration::from_secs(secs))),
            };
        }

        let lease_id = self
            .leases
            .issue(admission.into_guard())
            .map(|id| id.to_string())
            .unwrap_or_default();
        CheckResponse {
            code: Code::Ok.into(),
            status_code: 200,
            response_headers_to_add,
            raw_body: Vec::new(),
            lease_id,
            rule: String::new(),
            retry_after: None,
        }
    }
}

/// Convert a wire request into the gate's request type.
fn admission_request(req: CheckRequest) -> Result<AdmissionRequest, Status> {
    let client_address: IpAddr = req.client_address.trim().parse().map_err(|_| {
        warn!(client_address = %req.client_address, "Unparseable client address");
        Status::invalid_argument("client_address must be an IP address")
    })?;
    if !req.route_path.starts_with('/') {
        return Err(Status::invalid_argument("route_path must start with '/'"));
    }

    let mut request = AdmissionRequest::new(client_address, req.route_path);
    if let Some(identity) = req.identity.filter(|i| !i.id.is_empty()) {
        request = request.with_identity(Identity::new(identity.id, identity.roles));
    }
    Ok(request.with_api_key(req.api_key))
}

fn required_identity(identity: &str) -> Result<&str, Status> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(Status::invalid_argument("identity is required"));
    }
    Ok(identity)
}

fn wire_duration(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    /// Decide whether a request may proceed.
    #[instrument(
        skip(self, request),
        fields(
            client_address = %request.get_ref().client_address,
            route_path = %request.get_ref().route_path
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let request = admission_request(request.into_inner())?;
        let admission = self.gate.check(&request).await;
        debug!(allowed = admission.is_allowed(), "Admission decision made");
        Ok(Response::new(self.respond(admission)))
    }

    #[instrument(skip(self, request), fields(lease_id = %request.get_ref().lease_id))]
    async fn release(
        &self,
        request: Request<ReleaseRequest>,
    ) -> Result<Response<ReleaseResponse>, Status> {
        let id = Uuid::parse_str(&request.get_ref().lease_id)
            .map_err(|_| Status::invalid_argument("lease_id must be a UUID"))?;
        let released = self.leases.release(&id).await;
        if !released {
            debug!("Release for unknown or expired lease");
        }
        Ok(Response::new(ReleaseResponse { released }))
    }

    #[instrument(
        skip(self, request),
        fields(
            client_address = %request.get_ref().client_address,
            route_path = %request.get_ref().route_path
        )
    )]
    async fn record_failure(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let request = admission_request(request.into_inner())?;
        let admission = self.gate.record_failure(&request).await;
        Ok(Response::new(self.respond(admission)))
    }

    #[instrument(skip(self, request), fields(identity = %request.get_ref().identity))]
    async fn reset_key(
        &self,
        request: Request<ResetKeyRequest>,
    ) -> Result<Response<ResetKeyResponse>, Status> {
        let identity = required_identity(&request.get_ref().identity)?;
        let reset = self.gate.reset_key(identity).await;
        Ok(Response::new(ResetKeyResponse { reset }))
    }

    #[instrument(skip(self, request), fields(identity = %request.get_ref().identity))]
    async fn inspect_key(
        &self,
        request: Request<InspectKeyRequest>,
    ) -> Result<Response<InspectKeyResponse>, Status> {
        let identity = required_identity(&request.get_ref().identity)?;
        let counters = self.gate.inspect_key(identity).await.map_err(|e| {
            error!(error = %e, "Failed to inspect rate limit counters");
            Status::unavailable("counter store unavailable")
        })?;

        let counters: HashMap<String, proto::CounterValue> = counters
            .into_iter()
            .map(|(namespace, value)| {
                (
                    namespace,
                    proto::CounterValue {
                        count: value.count,
                        ttl: Some(wire_duration(value.ttl)),
                    },
                )
            })
            .collect();
        Ok(Response::new(InspectKeyResponse { counters }))
    }
}
