#![cfg(unix)]

mod _trace;
use _trace::Trace;

static TRACE: Trace<&str> = Trace::new();

#[test]
fn deadlines_tie_break_fifo_and_parents_drain_first() {
	vernal::ensure_initialized().expect("init failed");

	// Three zero-delay callbacks run in the order they were scheduled.
	for label in ["a", "b", "c"] {
		assert!(vernal::exec_later_task(vernal::GLOBAL_LOOP_ID, move || TRACE.record(label), 0.0)
			.is_some());
	}
	assert!(vernal::exec_callbacks(0.0, true, vernal::GLOBAL_LOOP_ID).expect("dispatch failed"));
	TRACE.assert_order(["a", "b", "c"]);

	// A parent's own queue drains before its children are visited.
	vernal::create_loop(7, vernal::GLOBAL_LOOP_ID).expect("create failed");
	vernal::exec_later_task(vernal::GLOBAL_LOOP_ID, || TRACE.record("p"), 0.0).expect("schedule failed");
	vernal::exec_later_task(7, || TRACE.record("q"), 0.0).expect("schedule failed");
	vernal::exec_later_task(vernal::GLOBAL_LOOP_ID, || TRACE.record("r"), 0.0).expect("schedule failed");
	assert!(vernal::exec_callbacks(0.0, true, vernal::GLOBAL_LOOP_ID).expect("dispatch failed"));
	TRACE.assert_order(["p", "r", "q"]);

	// Nothing left; a second dispatch finds no due work.
	assert!(!vernal::exec_callbacks(0.0, true, vernal::GLOBAL_LOOP_ID).expect("dispatch failed"));
	assert!(vernal::delete_loop(7).expect("delete failed"));
}
