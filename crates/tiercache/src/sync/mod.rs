//! Coordination primitives for concurrent loads.
//!
//! - [`DistributedLock`]: serializes loads and refreshes across processes
//! - [`WaitCoordinator`]: parks tasks of this process while another task loads

mod lock;
mod wait;

pub use lock::{DistributedLock, LOCK_POLL_INTERVAL, LockHandle};
pub use wait::WaitCoordinator;
