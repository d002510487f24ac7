//! The coordinator service.
//!
//! Owns the agent registry, the task queue with its fair-share scheduler,
//! and result settlement through the credit engine. Inbound mesh traffic
//! reaches it as events routed by the node binary; everything it wants
//! broadcast goes out through an outbound payload channel, so this crate
//! never touches a socket.

mod errors;
mod queue;
mod registry;
mod service;
mod traits;

pub use errors::CoordinatorError;
pub use queue::{PullFilter, TaskQueue};
pub use registry::{AgentRegistry, HeartbeatUpdate};
pub use service::{
    Coordinator, EnqueueDisposition, MeshReaction, ResultReport, StatusSnapshot,
};
pub use traits::{GenerationOutput, ModelBackend, ModelInfo, Worker, WorkerOutput};
