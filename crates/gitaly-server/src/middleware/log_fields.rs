use tonic::{Request, Status};
use tracing::{info_span, Span};

use super::correlation_id::CorrelationId;
use super::request_info::RequestInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogFields {
    pub(crate) correlation_id: String,
    pub(crate) service: String,
    pub(crate) method: String,
    pub(crate) full_method: String,
}

pub(crate) fn apply(mut request: Request<()>) -> Result<Request<()>, Status> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map_or_else(|| "unknown".to_string(), |id| id.0.clone());
    let info = request
        .extensions()
        .get::<RequestInfo>()
        .cloned()
        .unwrap_or_else(RequestInfo::unknown);

    request.extensions_mut().insert(LogFields {
        correlation_id,
        full_method: info.full_method(),
        service: info.service,
        method: info.method,
    });

    super::mark_step(request, "log_fields")
}

/// Span carrying the interceptor's log fields into the handler.
pub fn request_span<T>(request: &Request<T>) -> Span {
    match request.extensions().get::<LogFields>() {
        Some(fields) => info_span!(
            "grpc",
            correlation_id = %fields.correlation_id,
            grpc.method = %fields.method,
        ),
        None => info_span!("grpc"),
    }
}
