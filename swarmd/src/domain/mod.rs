//! Domain entities
//!
//! The four persisted collections: work items, agent runs, agent events, and
//! review iterations. Status enums round-trip through their TEXT column
//! representation.

mod agent_run;
mod event;
mod review;
mod work_item;

pub use agent_run::{AgentKind, AgentRun, AgentRunStatus, fix_agent_id, implement_agent_id};
pub use event::{AgentEvent, EventType};
pub use review::{IterationStatus, ReviewIteration};
pub use work_item::{WorkItem, WorkItemStatus};
