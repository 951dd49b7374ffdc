#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! Scheduling operations (`RegistryTable::schedule_*`, fd-wait creation and
//! cancellation) are callable from any thread. Everything that touches host
//! state (queue cancellation, loop creation and pruning, dispatch, waiting)
//! is main-thread only and debug-asserted as such once a main thread has been
//! [registered](main_thread::register_main_thread).

pub mod callback;
pub mod dispatch;
mod error;
#[cfg(unix)]
pub mod fd_wait;
pub mod main_thread;
mod registry;
mod table;
pub mod timestamp;

pub use callback::{CallbackId, HostWork, NativeFn, ParseCallbackIdError, TaskWork};
pub use error::{CallbackError, Error};
pub use registry::QueueItem;
pub use table::{LoopId, RegistryTable, GLOBAL_LOOP_ID, NO_PARENT};
pub use timestamp::Timestamp;

#[doc = include_str!("../README.md")]
mod readme {}
