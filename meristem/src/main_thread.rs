//! The designated main thread.
//!
//! The host runs its application code on one thread; callbacks are only ever
//! invoked there, and several operations (cancellation, loop lifecycle,
//! dispatch) are only legal there. The identity of that thread is captured
//! once, at initialisation, and the main-thread-only entry points
//! debug-assert against it.
//!
//! Until a main thread has been registered the assertions are vacuous, so
//! library-internal tests can exercise the pure machinery from any thread.

use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;

static MAIN_THREAD: OnceCell<ThreadId> = OnceCell::new();

/// Records the calling thread as the designated main thread.
///
/// Idempotent; later calls from other threads lose the race and change
/// nothing.
pub fn register_main_thread() {
	let _ = MAIN_THREAD.set(thread::current().id());
}

/// Whether the calling thread is the registered main thread.
///
/// `true` when no main thread has been registered yet.
#[must_use]
pub fn is_main_thread() -> bool {
	MAIN_THREAD
		.get()
		.map_or(true, |main| *main == thread::current().id())
}

/// Debug-asserts that the caller is on the main thread.
#[inline]
pub fn debug_assert_main_thread() {
	debug_assert!(
		is_main_thread(),
		"main-thread-only operation called from a background thread"
	);
}
