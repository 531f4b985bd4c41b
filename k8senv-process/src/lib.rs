//! A single external process: spawn, log capture, exactly one reaper task,
//! graceful-then-forced shutdown, and a readiness waiter that polls a
//! caller-supplied probe against it.

pub mod handle;
pub mod readiness;

pub use handle::{ProcessCommand, ProcessError, ProcessHandle};
pub use readiness::{wait_ready, ReadinessError};
