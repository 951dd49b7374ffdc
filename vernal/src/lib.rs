#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! `exec_later_task`, `exec_later_native`, `exec_later_fd` and fd-wait
//! cancellation may be called from any thread. Everything else on this
//! surface belongs to the main thread.

mod background;
mod diagnostics;
#[cfg(unix)]
mod wake;

use std::ffi::c_void;
#[cfg(unix)]
use std::os::unix::io::RawFd;

use meristem::{dispatch, RegistryTable};

pub use background::BackgroundTask;
pub use diagnostics::{log_level, LogLevel, UnknownLogLevel};
pub use meristem::dispatch::{
	at_top_level, get_current_loop, set_current_loop, set_stack_depth_query,
};
#[cfg(unix)]
pub use meristem::fd_wait::{FdCancelHandle, FD_RESULT_NA};
pub use meristem::{
	CallbackError, CallbackId, Error, LoopId, NativeFn, ParseCallbackIdError, QueueItem,
	Timestamp, GLOBAL_LOOP_ID, NO_PARENT,
};
#[cfg(unix)]
pub use wake::{
	ensure_initialized, handle_input_ready, pause_wakeups, request_wakeup, wake_fd, WakeupPause,
};

/// Creates a loop with host-visible id `id`, attached to `parent_id`
/// ([`NO_PARENT`] for none). Main thread only.
///
/// # Errors
///
/// [`Error::AlreadyExists`], [`Error::ParentMissing`].
pub fn create_loop(id: LoopId, parent_id: LoopId) -> Result<(), Error> {
	RegistryTable::global().create(id, parent_id)
}

/// Whether a loop with `id` is live. Thread-safe.
#[must_use]
pub fn exists_loop(id: LoopId) -> bool {
	RegistryTable::global().exists(id)
}

/// Deletes a loop, dropping its pending callbacks. Main thread only.
/// Returns `false` when no such loop exists.
///
/// # Errors
///
/// [`Error::InvalidState`] for the global loop and for the current loop.
pub fn delete_loop(id: LoopId) -> Result<bool, Error> {
	RegistryTable::global().delete(id)
}

/// Tells the runtime the host no longer holds a reference to the loop
/// (typically from a finalizer). The loop survives until it drains, unless
/// it is unreachable. Main thread only.
pub fn notify_loop_handle_released(id: LoopId) -> bool {
	RegistryTable::global().notify_host_ref_released(id)
}

/// Schedules a host callback on `loop_id` after `delay_secs` seconds.
/// Main thread only.
///
/// Returns the callback id as a decimal string (hosts may not have 64-bit
/// integers), or `"0"` when the loop does not exist. Errors the callback
/// reports when it eventually runs are caught at the dispatch barrier and
/// logged; they never unwind into the host.
pub fn exec_later<F>(loop_id: LoopId, func: F, delay_secs: f64) -> String
where
	F: FnOnce() -> Result<(), CallbackError> + 'static,
{
	RegistryTable::global()
		.schedule_host(loop_id, Box::new(func), delay_secs)
		.map_or_else(|| "0".to_owned(), |id| id.to_string())
}

/// Schedules owned `Send` work on `loop_id`. Thread-safe. `None` when the
/// loop does not exist.
pub fn exec_later_task<F>(loop_id: LoopId, work: F, delay_secs: f64) -> Option<CallbackId>
where
	F: FnOnce() + Send + 'static,
{
	RegistryTable::global().schedule_task(loop_id, Box::new(work), delay_secs)
}

/// Schedules a native callback on `loop_id`. Thread-safe. Returns the raw
/// callback id, or 0 when the loop does not exist.
///
/// `data` is owned by the caller and never dereferenced by the scheduler;
/// it must stay valid until `func(data)` runs (or `func` must free it).
pub fn exec_later_native(
	loop_id: LoopId,
	func: NativeFn,
	data: *mut c_void,
	delay_secs: f64,
) -> u64 {
	RegistryTable::global()
		.schedule_native(loop_id, func, data, delay_secs)
		.map_or(0, CallbackId::as_u64)
}

/// Cancels a queued callback by its decimal-string id. Main thread only.
/// Returns whether a callback was actually removed; malformed ids and the
/// reserved `"0"` never match.
#[must_use]
pub fn cancel(callback_id: &str, loop_id: LoopId) -> bool {
	callback_id
		.parse::<CallbackId>()
		.is_ok_and(|id| RegistryTable::global().cancel(id, loop_id))
}

/// Waits up to `timeout_secs` for due work in `loop_id` (and descendants),
/// then drains it. Main thread only. See
/// [`meristem::dispatch::exec_callbacks`] for the full contract.
///
/// # Errors
///
/// [`Error::NoSuchLoop`].
pub fn exec_callbacks(timeout_secs: f64, run_all: bool, loop_id: LoopId) -> Result<bool, Error> {
	dispatch::exec_callbacks(RegistryTable::global(), loop_id, timeout_secs, run_all)
}

/// Runs everything currently due on the global loop, repeating up to the
/// pump bound. Main thread only. Returns whether anything ran.
pub fn run_now() -> bool {
	dispatch::run_pump(RegistryTable::global())
}

/// Whether the loop has neither queued callbacks nor outstanding fd-waits.
///
/// # Errors
///
/// [`Error::NoSuchLoop`].
pub fn idle(loop_id: LoopId) -> Result<bool, Error> {
	RegistryTable::global().idle(loop_id)
}

/// Seconds until the next operation in the loop or its descendants;
/// `+inf` when nothing is queued.
///
/// # Errors
///
/// [`Error::NoSuchLoop`].
pub fn next_op_secs(loop_id: LoopId) -> Result<f64, Error> {
	RegistryTable::global().next_op_secs(loop_id)
}

/// Snapshot of the loop's own queue, earliest deadline first. Main thread
/// only.
///
/// # Errors
///
/// [`Error::NoSuchLoop`].
pub fn list_queue(loop_id: LoopId) -> Result<Vec<QueueItem>, Error> {
	RegistryTable::global().list_queue(loop_id)
}

/// Watches file descriptors in the background and schedules `completion`
/// on `loop_id` exactly once, on readiness, timeout or poll failure.
/// Callable from any thread.
///
/// Results are one `i32` per descriptor in read|write|except order: `0`
/// not ready, `1` ready, [`FD_RESULT_NA`] on an error condition. A
/// non-finite timeout never expires; a negative one means one second.
///
/// # Errors
///
/// [`Error::NoSuchLoop`]; [`Error::ThreadCreateFailed`].
#[cfg(unix)]
pub fn exec_later_fd<F>(
	completion: F,
	read_fds: &[RawFd],
	write_fds: &[RawFd],
	except_fds: &[RawFd],
	timeout_secs: f64,
	loop_id: LoopId,
) -> Result<FdCancelHandle, Error>
where
	F: FnOnce(&[i32]) + Send + 'static,
{
	meristem::fd_wait::exec_later_fd(
		RegistryTable::global(),
		loop_id,
		Box::new(completion),
		read_fds,
		write_fds,
		except_fds,
		timeout_secs,
	)
}

/// Cancels an outstanding fd-wait. Idempotent; `true` exactly once, and
/// only if the completion had not already run. Thread-safe.
#[cfg(unix)]
#[must_use]
pub fn fd_cancel(handle: &FdCancelHandle) -> bool {
	handle.cancel()
}
