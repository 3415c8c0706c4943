pub mod error;
pub mod ids;
pub mod models;

pub use error::{Error, Result};
pub use models::{
    next_average, BuildTask, ExecutionLog, ExecutionStatus, Function, FunctionStatus, LogLevel,
    TaskKind, TaskStatus, Workspace, DEFAULT_WORKSPACE_ID,
};
