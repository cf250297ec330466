//! Core data model: workflow definitions, execution records, and the
//! in-memory/persisted context that flows between them.

pub mod context;
pub mod execution;
pub mod workflow;

pub use context::{Checkpoint, ContextSnapshot, ExecutionContext, ExecutionState};
pub use execution::{Execution, NodeExecution, NodeExecutionStatus};
pub use workflow::{Connection, Node, NodeConfig, NodeType, Settings, Workflow};
