//! The main-thread dispatcher.
//!
//! Drains due callbacks for a loop and its descendants, in deadline order,
//! each invocation wrapped in an unwind barrier so one failing callback
//! never drops its siblings. Dispatch state (re-entrancy depth, current
//! loop) is a main-thread thread-local, saved and restored by RAII guards.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::callback::Callback;
use crate::error::{CallbackError, Error};
use crate::main_thread;
use crate::registry::Registry;
use crate::table::{LoopId, RegistryTable, GLOBAL_LOOP_ID};
use crate::timestamp::Timestamp;

/// How many times one host-idle firing may re-run the global loop. Bounds
/// the work done per firing while compensating for hosts that poll their
/// idle hook infrequently.
const MAX_IDLE_PASSES: usize = 20;

thread_local! {
	static REENTRANCY: Cell<usize> = const { Cell::new(0) };
	static CURRENT_LOOP: Cell<LoopId> = const { Cell::new(GLOBAL_LOOP_ID) };
}

static STACK_DEPTH_QUERY: OnceCell<Box<dyn Fn() -> i32 + Send + Sync>> = OnceCell::new();

/// Installs the host's stack-depth query (its `sys.nframe()` equivalent).
///
/// The driver only fires at a safe point: no dispatch in progress and a
/// reported depth of zero. Unset means depth zero. A negative report is
/// treated as "not at a safe point". First caller wins.
pub fn set_stack_depth_query(query: impl Fn() -> i32 + Send + Sync + 'static) {
	let _ = STACK_DEPTH_QUERY.set(Box::new(query));
}

fn host_stack_depth() -> i32 {
	STACK_DEPTH_QUERY.get().map_or(0, |query| query())
}

/// Whether it is safe to start a dispatch: no dispatch is already running
/// on this thread and the host reports no application frames on the stack.
#[must_use]
pub fn at_top_level() -> bool {
	main_thread::debug_assert_main_thread();
	REENTRANCY.with(Cell::get) == 0 && host_stack_depth() == 0
}

/// Selects the loop newly created work attaches to by convention.
pub fn set_current_loop(id: LoopId) {
	CURRENT_LOOP.with(|current| current.set(id));
}

/// The loop selected by [`set_current_loop`]; the global loop by default.
#[must_use]
pub fn get_current_loop() -> LoopId {
	CURRENT_LOOP.with(Cell::get)
}

/// Waits up to `timeout_secs` for something to become due in `loop_id` or
/// its descendants, then drains. Main thread only.
///
/// Deadlines are compared against one `now` snapshot, so work scheduled
/// mid-drain lands in the next dispatch. With `run_all == false` at most
/// one own-queue callback runs, but children are still visited. Returns
/// whether anything was drained.
///
/// # Errors
///
/// [`Error::NoSuchLoop`].
pub fn exec_callbacks(
	table: &RegistryTable,
	loop_id: LoopId,
	timeout_secs: f64,
	run_all: bool,
) -> Result<bool, Error> {
	main_thread::debug_assert_main_thread();
	let registry = table.get(loop_id).ok_or(Error::NoSuchLoop(loop_id))?;

	let previous_loop = get_current_loop();
	REENTRANCY.with(|depth| depth.set(depth.get() + 1));
	set_current_loop(loop_id);
	let _restore = scopeguard::guard((), move |()| {
		set_current_loop(previous_loop);
		REENTRANCY.with(|depth| depth.set(depth.get() - 1));
	});

	if !registry.wait(timeout_secs, true) {
		return Ok(false);
	}
	let now = Timestamp::now();
	drain(&registry, now, run_all);
	table.prune();
	Ok(true)
}

/// Runs the global loop until a pass drains nothing, up to
/// [`MAX_IDLE_PASSES`] passes. The idle driver's entry point. Returns
/// whether any pass drained work.
pub fn run_pump(table: &RegistryTable) -> bool {
	let mut ran_any = false;
	for _ in 0..MAX_IDLE_PASSES {
		match exec_callbacks(table, GLOBAL_LOOP_ID, 0.0, true) {
			Ok(true) => ran_any = true,
			Ok(false) => break,
			Err(error) => {
				log::error!("idle pump failed: {error}");
				break;
			}
		}
	}
	ran_any
}

fn drain(registry: &Arc<Registry>, now: Timestamp, run_all: bool) {
	loop {
		let callback = {
			let guard = registry.lock();
			registry.pop(now, &guard)
		};
		let Some(callback) = callback else { break };
		invoke_under_barrier(callback);
		if !run_all {
			break;
		}
	}
	let children = {
		let guard = registry.lock();
		registry.children(&guard)
	};
	for child in children {
		drain(&child, now, true);
	}
}

fn invoke_under_barrier(callback: Callback) {
	let id = callback.id();
	let kind = callback.kind();
	let error = match catch_unwind(AssertUnwindSafe(move || callback.invoke())) {
		Ok(Ok(())) => return,
		Ok(Err(error)) => error,
		Err(payload) => CallbackError::Native(panic_message(payload.as_ref())),
	};
	// Reported and absorbed: the next callback still runs.
	log::error!("callback {id} ({kind}) failed: {error}");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload
		.downcast_ref::<&str>()
		.map(|message| (*message).to_owned())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "opaque panic payload".to_owned())
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::{at_top_level, exec_callbacks, get_current_loop, run_pump};
	use crate::table::{RegistryTable, GLOBAL_LOOP_ID};

	fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let push = {
			let seen = Arc::clone(&seen);
			move |label| seen.lock().expect("recorder poisoned").push(label)
		};
		(seen, push)
	}

	#[test]
	fn equal_deadlines_run_in_schedule_order() {
		let table = RegistryTable::new();
		let (seen, push) = recorder();
		for label in ["a", "b", "c"] {
			let push = push.clone();
			table
				.schedule_task(GLOBAL_LOOP_ID, Box::new(move || push(label)), 0.0)
				.expect("schedule failed");
		}
		assert!(exec_callbacks(&table, GLOBAL_LOOP_ID, 0.0, true).expect("dispatch failed"));
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["a", "b", "c"]);
	}

	#[test]
	fn parents_drain_before_children() {
		let table = RegistryTable::new();
		table.create(7, GLOBAL_LOOP_ID).expect("create failed");
		let (seen, push) = recorder();
		for (loop_id, label) in [(GLOBAL_LOOP_ID, "p"), (7, "q"), (GLOBAL_LOOP_ID, "r")] {
			let push = push.clone();
			table
				.schedule_task(loop_id, Box::new(move || push(label)), 0.0)
				.expect("schedule failed");
		}
		exec_callbacks(&table, GLOBAL_LOOP_ID, 0.0, true).expect("dispatch failed");
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["p", "r", "q"]);
	}

	#[test]
	fn run_all_false_takes_a_single_own_callback() {
		let table = RegistryTable::new();
		let (seen, push) = recorder();
		for label in ["a", "b"] {
			let push = push.clone();
			table
				.schedule_task(GLOBAL_LOOP_ID, Box::new(move || push(label)), 0.0)
				.expect("schedule failed");
		}
		exec_callbacks(&table, GLOBAL_LOOP_ID, 0.0, false).expect("dispatch failed");
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["a"]);
		exec_callbacks(&table, GLOBAL_LOOP_ID, 0.0, false).expect("dispatch failed");
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["a", "b"]);
	}

	#[test]
	fn a_panicking_callback_does_not_drop_siblings() {
		let table = RegistryTable::new();
		let (seen, push) = recorder();
		table
			.schedule_task(GLOBAL_LOOP_ID, Box::new(|| panic!("boom")), 0.0)
			.expect("schedule failed");
		{
			let push = push.clone();
			table
				.schedule_task(GLOBAL_LOOP_ID, Box::new(move || push("survivor")), 0.0)
				.expect("schedule failed");
		}
		exec_callbacks(&table, GLOBAL_LOOP_ID, 0.0, true).expect("dispatch failed");
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["survivor"]);
	}

	#[test]
	fn dispatch_is_not_top_level_and_restores_the_current_loop() {
		let table = RegistryTable::new();
		table.create(3, GLOBAL_LOOP_ID).expect("create failed");
		let (seen, _push) = recorder();
		{
			let seen = Arc::clone(&seen);
			table
				.schedule_task(
					3,
					Box::new(move || {
						assert!(!at_top_level());
						assert_eq!(get_current_loop(), 3);
						seen.lock().expect("recorder poisoned").push("ran");
					}),
					0.0,
				)
				.expect("schedule failed");
		}
		assert!(at_top_level());
		exec_callbacks(&table, 3, 0.0, true).expect("dispatch failed");
		assert_eq!(get_current_loop(), GLOBAL_LOOP_ID);
		assert!(at_top_level());
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["ran"]);
	}

	#[test]
	fn the_pump_drains_everything_scheduled_so_far() {
		let table = RegistryTable::new();
		let (seen, push) = recorder();
		{
			let push = push.clone();
			table
				.schedule_task(GLOBAL_LOOP_ID, Box::new(move || push("one")), 0.0)
				.expect("schedule failed");
		}
		assert!(run_pump(&table));
		assert!(!run_pump(&table));
		assert_eq!(*seen.lock().expect("recorder poisoned"), ["one"]);
	}
}
