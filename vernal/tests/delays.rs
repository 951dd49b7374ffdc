#![cfg(unix)]

use std::thread::sleep;
use std::time::{Duration, Instant};

mod _trace;
use _trace::Trace;

static TRACE: Trace<&str> = Trace::new();

#[test]
fn delays_are_honored_and_cancellation_is_single_shot() {
	vernal::ensure_initialized().expect("init failed");

	// A 200 ms callback is not due on an immediate dispatch.
	vernal::exec_later_task(0, || TRACE.record("late"), 0.2).expect("schedule failed");
	assert!(!vernal::exec_callbacks(0.0, true, 0).expect("dispatch failed"));
	TRACE.assert_order([]);
	sleep(Duration::from_millis(250));
	assert!(vernal::exec_callbacks(0.0, true, 0).expect("dispatch failed"));
	TRACE.assert_order(["late"]);

	// Cancellation removes the callback and reports true exactly once.
	let id = vernal::exec_later_task(0, || TRACE.record("never"), 0.1)
		.expect("schedule failed")
		.to_string();
	assert!(vernal::cancel(&id, 0));
	assert!(!vernal::cancel(&id, 0));
	sleep(Duration::from_millis(300));
	assert!(!vernal::exec_callbacks(0.0, true, 0).expect("dispatch failed"));
	TRACE.assert_order([]);

	// Malformed ids and the reserved zero never match anything.
	assert!(!vernal::cancel("0", 0));
	assert!(!vernal::cancel("bogus", 0));

	// A blocking dispatch sleeps until the deadline arrives.
	vernal::exec_later_task(0, || TRACE.record("soon"), 0.1).expect("schedule failed");
	let started = Instant::now();
	assert!(vernal::exec_callbacks(5.0, true, 0).expect("dispatch failed"));
	assert!(started.elapsed() >= Duration::from_millis(80));
	TRACE.assert_order(["soon"]);

	// Negative delays mean "immediately".
	vernal::exec_later_task(0, || TRACE.record("now"), -3.0).expect("schedule failed");
	assert!(vernal::exec_callbacks(0.0, true, 0).expect("dispatch failed"));
	TRACE.assert_order(["now"]);
}
