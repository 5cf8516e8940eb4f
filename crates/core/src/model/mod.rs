mod execution;
mod ids;
mod node;

pub use execution::{ExecStatus, ExecutionRecord, ProgressState, annotate_ready};
pub use ids::{NodeId, UserId};
pub use node::{ContentNode, NodeError, NodeKind, ShareScope};
