use std::sync::Arc;

use tonic::transport::server::Router;

use gitaly_proto::gitaly::operation_service_server::OperationServiceServer;
use gitaly_proto::gitaly::ref_service_server::RefServiceServer;

use crate::dependencies::Dependencies;
use crate::middleware;
use crate::service::operations::OperationServiceImpl;
use crate::service::ref_::RefServiceImpl;

#[derive(Debug, Default, Clone, Copy)]
pub struct GitalyServer;

impl GitalyServer {
    /// Registers the operation and ref services behind the interceptor chain.
    #[must_use]
    pub fn build_router_with_dependencies(dependencies: Arc<Dependencies>) -> Router {
        let interceptor = middleware::ordered_interceptor();

        tonic::transport::Server::builder()
            .add_service(OperationServiceServer::with_interceptor(
                OperationServiceImpl::new(Arc::clone(&dependencies)),
                interceptor.clone(),
            ))
            .add_service(RefServiceServer::with_interceptor(
                RefServiceImpl::new(dependencies),
                interceptor,
            ))
    }
}
