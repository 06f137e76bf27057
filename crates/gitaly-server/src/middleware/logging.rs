use tonic::{Request, Status};
use tracing::info;

use super::log_fields::LogFields;

pub(crate) fn apply(request: Request<()>) -> Result<Request<()>, Status> {
    let peer = request
        .remote_addr()
        .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());

    match request.extensions().get::<LogFields>() {
        Some(fields) => info!(
            correlation_id = %fields.correlation_id,
            grpc.service = %fields.service,
            grpc.method = %fields.method,
            grpc.full_method = %fields.full_method,
            peer = %peer,
            "incoming gRPC request"
        ),
        None => info!(peer = %peer, "incoming gRPC request"),
    }

    super::mark_step(request, "logging")
}
