#![allow(clippy::derive_partial_eq_without_eq, non_snake_case)]
// https://github.com/hyperium/tonic/issues/1056

mod grpc_axonservice_wrapper;

pub use grpc_axonservice_wrapper::GRPCAxonServiceWrapper;

tonic::include_proto!("axon.v1");


/// Request metadata key carrying the caller identity.
pub const USER_METADATA_KEY: &str = "axon-user";

/// Identity assumed for callers that don't announce one.
pub const ANON_USER: &str = "anon";

/// Upper bound for data frames on the wire. Storage chunks are 16 MiB,
/// well above tonic's default message size limits, so streams re-slice
/// to this before sending.
pub const RPC_CHUNK_SIZE: usize = 1024 * 1024;
