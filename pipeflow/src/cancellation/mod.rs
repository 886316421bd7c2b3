//! Structured cancellation utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - TaskGroup for spawning and joining the tasks of one run

mod task_group;
mod token;

pub use task_group::TaskGroup;
pub use token::CancellationToken;
