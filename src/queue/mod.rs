//! Durable FIFO journal of writes waiting to reach the remote service.

mod storage;
mod types;

pub use storage::OperationQueue;
pub use types::{OperationKind, PendingOperation};
