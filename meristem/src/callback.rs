//! Scheduled units of work and their total order.

use std::ffi::c_void;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CallbackError;
use crate::main_thread;
use crate::timestamp::Timestamp;

/// Process-wide callback id allocator. 0 is reserved to mean "none/error"
/// at the string-encoded surface, so allocation starts at 1.
static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a scheduled callback.
///
/// Strictly monotonically increasing across the process, which makes it both
/// a cancellation token and the FIFO tiebreaker between equal deadlines.
/// Displayed and parsed as a decimal string because hosts may not have
/// 64-bit integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
	pub(crate) fn next() -> Self {
		Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
	}

	/// The raw value; never 0 for a live callback.
	#[must_use]
	pub fn as_u64(self) -> u64 {
		self.0
	}

	/// Reconstructs an id from its raw value; 0 is the none/error encoding.
	#[must_use]
	pub fn from_u64(raw: u64) -> Option<Self> {
		(raw != 0).then_some(Self(raw))
	}
}

impl Display for CallbackId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

/// Returned when a string is not a decimal callback id, or is the reserved
/// `"0"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseCallbackIdError;

impl Display for ParseCallbackIdError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str("not a valid callback id")
	}
}

impl std::error::Error for ParseCallbackIdError {}

impl FromStr for CallbackId {
	type Err = ParseCallbackIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.trim()
			.parse::<u64>()
			.ok()
			.and_then(Self::from_u64)
			.ok_or(ParseCallbackIdError)
	}
}

/// A host-function handle, wrapped by the embedder's glue.
///
/// Reports host-level failures through its return value; the dispatcher's
/// barrier turns those (and panics) into log reports.
pub type HostWork = Box<dyn FnOnce() -> Result<(), CallbackError>>;

/// Owned thread-safe work. Used by fd-wait completions and background-task
/// results, and available to embedders directly.
pub type TaskWork = Box<dyn FnOnce() + Send>;

/// The FFI callback shape: a C function pointer plus a caller-owned pointer.
pub type NativeFn = unsafe extern "C" fn(data: *mut c_void);

pub(crate) enum Work {
	Host(HostWork),
	Task(TaskWork),
	Native { func: NativeFn, data: *mut c_void },
}

/// A queued callback: deadline, identity, and the work itself.
pub(crate) struct Callback {
	when: Timestamp,
	id: CallbackId,
	work: Work,
}

/// # Safety
///
/// Two non-`Send` things cross threads inside `Callback`, both under
/// documented contracts:
///
/// - `Work::Host` closures hold host-managed state. They are constructed,
///   invoked and dropped only on the main thread (debug-asserted); other
///   threads at most move the box while holding the shared registry lock.
/// - `Work::Native` `data` pointers are owned by the caller and never
///   dereferenced by the scheduler. The caller must keep `data` valid until
///   `func(data)` runs or arrange for `func` to free it.
unsafe impl Send for Callback {}

impl Callback {
	/// Wraps a host-function handle. Main thread only.
	pub(crate) fn host(when: Timestamp, work: HostWork) -> Self {
		main_thread::debug_assert_main_thread();
		Self {
			when,
			id: CallbackId::next(),
			work: Work::Host(work),
		}
	}

	/// Wraps owned `Send` work. Any thread.
	pub(crate) fn task(when: Timestamp, work: TaskWork) -> Self {
		Self {
			when,
			id: CallbackId::next(),
			work: Work::Task(work),
		}
	}

	/// Wraps a native function pointer. Any thread.
	pub(crate) fn native(when: Timestamp, func: NativeFn, data: *mut c_void) -> Self {
		Self {
			when,
			id: CallbackId::next(),
			work: Work::Native { func, data },
		}
	}

	pub(crate) fn when(&self) -> Timestamp {
		self.when
	}

	pub(crate) fn id(&self) -> CallbackId {
		self.id
	}

	pub(crate) fn kind(&self) -> &'static str {
		match self.work {
			Work::Host(_) => "host",
			Work::Task(_) => "task",
			Work::Native { .. } => "native",
		}
	}

	/// Runs the callback. Main thread only; the dispatcher wraps this in its
	/// unwind barrier.
	pub(crate) fn invoke(self) -> Result<(), CallbackError> {
		main_thread::debug_assert_main_thread();
		match self.work {
			Work::Host(work) => work(),
			Work::Task(work) => {
				work();
				Ok(())
			}
			Work::Native { func, data } => {
				unsafe { func(data) };
				Ok(())
			}
		}
	}
}

impl Debug for Callback {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Callback")
			.field("when", &self.when)
			.field("id", &self.id)
			.field("kind", &self.kind())
			.finish()
	}
}

impl PartialEq for Callback {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Callback {}

impl PartialOrd for Callback {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Callback {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		// Deadline first; the monotonic id makes equal deadlines FIFO.
		self.when
			.cmp(&other.when)
			.then_with(|| self.id.cmp(&other.id))
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::{Callback, CallbackId};
	use crate::timestamp::Timestamp;

	#[test]
	fn ids_are_unique_and_increasing_across_threads() {
		let handles: Vec<_> = (0..4)
			.map(|_| {
				thread::spawn(|| {
					let ids: Vec<_> = (0..100).map(|_| CallbackId::next()).collect();
					assert!(ids.windows(2).all(|w| w[0] < w[1]));
					ids
				})
			})
			.collect();
		let mut all: Vec<_> = handles
			.into_iter()
			.flat_map(|h| h.join().expect("allocator thread panicked"))
			.collect();
		let len = all.len();
		all.sort_unstable();
		all.dedup();
		assert_eq!(all.len(), len);
	}

	#[test]
	fn order_is_deadline_then_id() {
		let soon = Timestamp::from_now(0.0);
		let later = Timestamp::from_now(60.0);
		let a = Callback::task(later, Box::new(|| ()));
		let b = Callback::task(soon, Box::new(|| ()));
		let c = Callback::task(soon, Box::new(|| ()));
		// Earlier deadline wins regardless of allocation order.
		assert!(b < a);
		// Equal deadlines fall back to allocation order.
		assert!(b < c);
		assert!(c < a);
	}

	#[test]
	fn decimal_encoding_round_trips_and_zero_is_none() {
		assert!(CallbackId::from_u64(0).is_none());
		let id = CallbackId::next();
		assert_eq!(CallbackId::from_u64(id.as_u64()), Some(id));
		assert_eq!(id.to_string().parse::<CallbackId>(), Ok(id));
		assert_eq!(format!(" {id} ").parse::<CallbackId>(), Ok(id));
		assert!("0".parse::<CallbackId>().is_err());
		assert!("".parse::<CallbackId>().is_err());
		assert!("-7".parse::<CallbackId>().is_err());
		assert!("bogus".parse::<CallbackId>().is_err());
	}
}
