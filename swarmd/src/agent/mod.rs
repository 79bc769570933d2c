//! Agent pool supervision
//!
//! Spawning, timing out, rate-limit handling, and resumption of the external
//! agent processes, plus the post-completion PR recovery steps.

mod handle;
mod pool;
pub mod ratelimit;

pub use handle::{AgentHandle, AgentOutcome, AgentSpawnSpec};
pub use pool::{AgentPool, DispatchRequest};
