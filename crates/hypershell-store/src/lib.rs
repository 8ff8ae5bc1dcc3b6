//! The durable task catalog and assignment state machine (spec section 4.2).

pub mod durable;
pub mod error;
pub mod filter;
pub mod store_trait;
pub mod task;
pub mod volatile;

pub use durable::DurableStore;
pub use error::StoreError;
pub use filter::{OrderBy, TaskFilter};
pub use store_trait::Store;
pub use task::{Task, TaskState, TaskUpdate};
pub use volatile::VolatileStore;
