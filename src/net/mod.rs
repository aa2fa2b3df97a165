pub mod grpc;
pub mod local;
pub mod transport;
pub mod wire;
