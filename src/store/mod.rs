//! Persistence layer for task records.

mod file;
mod memory;
pub mod traits;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
pub use traits::{StoreStatistics, TaskFilter, TaskStore};
