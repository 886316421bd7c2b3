//! Observability utilities.
//!
//! The engine logs through `tracing` and reports lifecycle events through an
//! [`EventSink`](crate::events::EventSink). This module installs a global
//! subscriber for binaries and demos; libraries embedding pipeflow should
//! configure their own.

mod logging;

pub use logging::{init_logging, LogFormat, DEFAULT_FILTER};
