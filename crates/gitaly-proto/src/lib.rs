//! Protobuf bindings for the repository operation services.

pub mod gitaly {
    tonic::include_proto!("gitaly");
}
