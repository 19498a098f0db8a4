//! # sdb-tasks
//!
//! Scheduling primitives for the connection runtime:
//!
//! - [`AbortSignal`]: reason-carrying cancellation, with timeouts as signals
//! - [`SettledFuture`]: an outcome holder that always completes and replays
//! - [`TaskQueue`]: tracked cancellable tasks with wait-all and abort-all
//! - [`TaskEmitter`]: pub/sub where every listener call is a queued task

#![deny(unsafe_code)]

pub mod emitter;
pub mod queue;
pub mod settled;
pub mod signal;

pub use emitter::{Listener, TaskEmitter, listener};
pub use queue::{TaskContext, TaskQueue};
pub use settled::{SettledFuture, SettledState, Settler};
pub use signal::AbortSignal;
