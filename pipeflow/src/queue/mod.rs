//! Bounded queues connecting pipeline stages.
//!
//! A [`BoundedQueue`] is the only object shared between the tasks of a
//! pipeline: stage workers and drivers communicate exclusively through it.

mod bounded;
mod stats;

pub use bounded::BoundedQueue;
pub use stats::{QueueProbe, QueueStats};
