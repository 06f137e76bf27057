use tonic::{GrpcMethod, Request, Status};

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestInfo {
    pub(crate) service: String,
    pub(crate) method: String,
}

impl RequestInfo {
    pub(crate) fn unknown() -> Self {
        Self {
            service: UNKNOWN.to_string(),
            method: UNKNOWN.to_string(),
        }
    }

    pub(crate) fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

pub(crate) fn apply(mut request: Request<()>) -> Result<Request<()>, Status> {
    let info = request
        .extensions()
        .get::<GrpcMethod<'static>>()
        .map_or_else(RequestInfo::unknown, |grpc_method| RequestInfo {
            service: grpc_method.service().to_string(),
            method: grpc_method.method().to_string(),
        });

    request.extensions_mut().insert(info);
    super::mark_step(request, "request_info")
}
