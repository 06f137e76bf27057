//! gRPC front end for the repository operation services.

pub mod dependencies;
pub mod middleware;
pub mod server;
pub mod service;

#[cfg(test)]
mod testing;

pub use dependencies::Dependencies;
pub use server::GitalyServer;
pub use service::operations::OperationServiceImpl;
pub use service::ref_::RefServiceImpl;
