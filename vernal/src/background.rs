//! One-shot background work whose result lands back on a loop.

use std::thread;

use meristem::{Error, LoopId, RegistryTable};

/// A task that runs once on a background thread and completes on the main
/// thread.
///
/// Nothing host-owned may be touched from [`execute`](Self::execute);
/// anything the completion needs must travel through
/// [`Output`](Self::Output). [`complete`](Self::complete) runs as an
/// ordinary callback on the chosen loop, so host state is safe there.
pub trait BackgroundTask: Send + Sized + 'static {
	/// Carries the result from the worker to the completion.
	type Output: Send + 'static;

	/// The work itself; runs on a background thread.
	fn execute(&mut self) -> Self::Output;

	/// Runs on the main thread once the work is done.
	fn complete(self, output: Self::Output);

	/// Starts the task, scheduling [`complete`](Self::complete) on
	/// `loop_id` with no delay once [`execute`](Self::execute) returns.
	///
	/// # Errors
	///
	/// [`Error::ThreadCreateFailed`] when the OS refuses the worker thread.
	fn begin(self, loop_id: LoopId) -> Result<(), Error> {
		let mut task = self;
		thread::Builder::new()
			.name("vernal-background".into())
			.spawn(move || {
				let output = task.execute();
				let scheduled = RegistryTable::global().schedule_task(
					loop_id,
					Box::new(move || task.complete(output)),
					0.0,
				);
				if scheduled.is_none() {
					log::warn!("background-task completion dropped: loop {loop_id} is gone");
				}
			})
			.map(|_handle| ())
			.map_err(Error::ThreadCreateFailed)
	}
}
