//! Network-facing activities served on the execution lane.

pub mod grpc;
pub mod http;

use tideway_core::substrate::activity::ActivityRegistry;

pub use grpc::CallGrpcActivity;
pub use http::CallHttpActivity;

/// Register `CallHTTP` and `CallGRPC` on `task_queue`.
pub fn register_call_activities(registry: &mut ActivityRegistry, task_queue: &str) -> Result<(), reqwest::Error> {
    registry.register(task_queue, CallHttpActivity::new()?);
    registry.register(task_queue, CallGrpcActivity::new()?);
    Ok(())
}
