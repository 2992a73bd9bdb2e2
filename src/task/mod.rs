//! Task records and the task state machine.

pub mod model;
pub mod state;

pub use model::{
    Action, ActionResult, ActionStatus, ActionSummary, Priority, Task, TaskError,
    TaskErrorKind, TaskSnapshot, TaskType,
};
pub use state::{StateTransition, TaskStatus, TransitionError};
