//! Background fd-wait workers.
//!
//! An fd-wait watches a set of file descriptors and, on readiness (or
//! timeout, or poll failure), schedules a completion callback on a loop,
//! exactly once. Workers are short-lived detached threads; they poll in
//! slices of at most one second so cancellation is observed promptly.
//!
//! Results are one `i32` per descriptor, in read|write|except order:
//! `0` not ready, `1` ready, [`FD_RESULT_NA`] for an error condition on the
//! descriptor (POLLERR/POLLHUP/POLLNVAL) or a failed poll.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::libc::c_int;
use nix::poll::{poll, PollFd, PollFlags};

use crate::callback::TaskWork;
use crate::error::Error;
use crate::registry::Registry;
use crate::table::{LoopId, RegistryTable};
use crate::timestamp::Timestamp;

/// The "error condition" marker in a results vector.
pub const FD_RESULT_NA: i32 = i32::MIN;

/// Longest single poll, so cancellation is seen within a second.
const MAX_POLL_SLICE_MS: c_int = 1000;

/// The completion callback: receives one result per watched descriptor.
pub type FdCompletion = Box<dyn FnOnce(&[i32]) + Send>;

/// Cancels an outstanding fd-wait.
///
/// Shared flag between handle, worker and scheduled completion; whoever
/// flips it first wins, so a wait is either cancelled or completed, never
/// both.
pub struct FdCancelHandle {
	active: Arc<AtomicBool>,
}

impl FdCancelHandle {
	/// Cancels the wait. Idempotent; returns `true` exactly once, and only
	/// if the completion had not already run.
	pub fn cancel(&self) -> bool {
		self.active
			.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}
}

/// Keeps the target registry's fd-wait count raised until the completion
/// wrapper is dropped (run, suppressed, or discarded with its loop).
struct FdWaitGuard {
	registry: Arc<Registry>,
}

impl Drop for FdWaitGuard {
	fn drop(&mut self) {
		self.registry.fd_waits_decr();
	}
}

/// Watches descriptors and schedules `completion` on `loop_id` when one
/// becomes ready, the timeout lapses, or the poll fails. Callable from any
/// thread.
///
/// Timeout normalisation: non-finite means "never", negative means one
/// second.
///
/// # Errors
///
/// [`Error::NoSuchLoop`]; [`Error::ThreadCreateFailed`] when the OS refuses
/// the worker thread.
pub fn exec_later_fd(
	table: &'static RegistryTable,
	loop_id: LoopId,
	completion: FdCompletion,
	read_fds: &[RawFd],
	write_fds: &[RawFd],
	except_fds: &[RawFd],
	timeout_secs: f64,
) -> Result<FdCancelHandle, Error> {
	let registry = table.get(loop_id).ok_or(Error::NoSuchLoop(loop_id))?;
	registry.fd_waits_incr();
	let counter = FdWaitGuard { registry };

	let interests: Vec<(RawFd, PollFlags)> = read_fds
		.iter()
		.map(|&fd| (fd, PollFlags::POLLIN))
		.chain(write_fds.iter().map(|&fd| (fd, PollFlags::POLLOUT)))
		.chain(except_fds.iter().map(|&fd| (fd, PollFlags::POLLPRI)))
		.collect();
	let timeout = normalize_timeout(timeout_secs);
	let active = Arc::new(AtomicBool::new(true));
	let handle = FdCancelHandle {
		active: Arc::clone(&active),
	};

	thread::Builder::new()
		.name("meristem-fd-wait".into())
		.spawn(move || {
			if let Some(results) = poll_until(&interests, timeout, &active) {
				let task: TaskWork = Box::new(move || {
					let _release = counter;
					// Suppressed if cancelled between scheduling and now.
					if active
						.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
						.is_ok()
					{
						completion(&results);
					}
				});
				if table.schedule_task(loop_id, task, 0.0).is_none() {
					log::warn!("fd-wait completion dropped: loop {loop_id} is gone");
				}
			}
		})
		.map_err(Error::ThreadCreateFailed)?;

	Ok(handle)
}

fn normalize_timeout(timeout_secs: f64) -> Option<f64> {
	if !timeout_secs.is_finite() {
		None
	} else if timeout_secs < 0.0 {
		Some(1.0)
	} else {
		Some(timeout_secs)
	}
}

/// Polls until readiness, timeout or cancellation. `None` means cancelled
/// (nothing must be scheduled); otherwise the per-fd results.
fn poll_until(
	interests: &[(RawFd, PollFlags)],
	timeout_secs: Option<f64>,
	active: &AtomicBool,
) -> Option<Vec<i32>> {
	let deadline = timeout_secs.map(Timestamp::from_now);
	let mut fds: Vec<PollFd> = interests
		.iter()
		.map(|&(fd, events)| PollFd::new(fd, events))
		.collect();
	loop {
		if !active.load(Ordering::SeqCst) {
			return None;
		}
		let slice_ms = match deadline {
			None => MAX_POLL_SLICE_MS,
			Some(deadline) => {
				let remaining = deadline.diff_secs(Timestamp::now());
				if remaining <= 0.0 {
					return Some(vec![0; interests.len()]);
				}
				#[allow(clippy::cast_possible_truncation)]
				let ms = (remaining * 1000.0).ceil().min(f64::from(MAX_POLL_SLICE_MS)) as c_int;
				ms.max(1)
			}
		};
		match poll(&mut fds, slice_ms) {
			Err(Errno::EINTR) => {}
			Err(errno) => {
				log::warn!("fd-wait poll failed: {errno}");
				return Some(vec![FD_RESULT_NA; interests.len()]);
			}
			Ok(0) => {}
			Ok(_) => {
				if !active.load(Ordering::SeqCst) {
					return None;
				}
				return Some(
					fds.iter()
						.zip(interests)
						.map(|(pollfd, &(_, events))| {
							let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
							if revents.intersects(
								PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL,
							) {
								FD_RESULT_NA
							} else if revents.intersects(events) {
								1
							} else {
								0
							}
						})
						.collect(),
				);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use nix::poll::PollFlags;
	use nix::unistd::{close, pipe, write};

	use super::{normalize_timeout, poll_until, FD_RESULT_NA};

	#[test]
	fn timeout_normalisation() {
		assert_eq!(normalize_timeout(0.5), Some(0.5));
		assert_eq!(normalize_timeout(0.0), Some(0.0));
		assert_eq!(normalize_timeout(-3.0), Some(1.0));
		assert_eq!(normalize_timeout(f64::INFINITY), None);
		assert_eq!(normalize_timeout(f64::NAN), None);
	}

	#[test]
	fn quiet_descriptor_times_out_with_zeroes() {
		let (reader, writer) = pipe().expect("pipe failed");
		let active = AtomicBool::new(true);
		let results = poll_until(&[(reader, PollFlags::POLLIN)], Some(0.05), &active);
		assert_eq!(results, Some(vec![0]));
		close(reader).expect("close failed");
		close(writer).expect("close failed");
	}

	#[test]
	fn readable_descriptor_reports_ready() {
		let (reader, writer) = pipe().expect("pipe failed");
		write(writer, b"x").expect("write failed");
		let active = AtomicBool::new(true);
		let results = poll_until(&[(reader, PollFlags::POLLIN)], Some(5.0), &active);
		assert_eq!(results, Some(vec![1]));
		close(reader).expect("close failed");
		close(writer).expect("close failed");
	}

	#[test]
	fn hung_up_descriptor_reports_na() {
		let (reader, writer) = pipe().expect("pipe failed");
		close(writer).expect("close failed");
		let active = AtomicBool::new(true);
		let results = poll_until(&[(reader, PollFlags::POLLIN)], Some(0.05), &active);
		assert_eq!(results, Some(vec![FD_RESULT_NA]));
		close(reader).expect("close failed");
	}

	#[test]
	fn cancellation_schedules_nothing() {
		let (reader, writer) = pipe().expect("pipe failed");
		let active = AtomicBool::new(false);
		let results = poll_until(&[(reader, PollFlags::POLLIN)], None, &active);
		assert_eq!(results, None);
		close(reader).expect("close failed");
		close(writer).expect("close failed");
	}
}
