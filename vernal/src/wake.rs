//! The POSIX idle driver: a wake pipe and its timer.
//!
//! The read end of a non-blocking pipe is handed to the host's
//! input-handler table ([`wake_fd`]). Any thread can [`request_wakeup`]:
//! an already-due request writes one byte, and only while the pipe is
//! "cold", so redundant requests collapse; a future one is delegated to a
//! lazily-spawned timer thread that sleeps until the earliest requested
//! deadline and then writes the byte itself.
//!
//! When the host polls the pipe it calls [`handle_input_ready`]. At a safe
//! point (no dispatch in progress, no host frames on the stack, not
//! paused) that drains the byte, marks the pipe cold, pumps the global
//! loop and re-arms for whatever work remains; otherwise it returns
//! immediately, leaving the byte in the pipe so the host calls back in.
//!
//! On fork the child closes both pipe ends and resets, so the next
//! [`ensure_initialized`] rebuilds the driver; the handler touches only
//! atomics, since arbitrary locks may be dead in the child.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Once;
use std::thread;

use meristem::{dispatch, main_thread, RegistryTable, Timestamp};
use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, read, write};
use parking_lot::{Condvar, Mutex};

use crate::diagnostics;
use crate::Error;

static READ_FD: AtomicI32 = AtomicI32::new(-1);
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Whether a wake byte is already in the pipe.
static HOT: AtomicBool = AtomicBool::new(false);

/// While non-zero the driver refuses to fire.
static PAUSED: AtomicUsize = AtomicUsize::new(0);

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static ATFORK: Once = Once::new();

static TIMER_RUNNING: AtomicBool = AtomicBool::new(false);
static TIMER: WakeTimer = WakeTimer::new();

/// Initialises the idle driver on the calling thread, which becomes the
/// designated main thread. Idempotent.
///
/// Creates the wake pipe, installs the scheduler's wakeup hook, applies
/// the default log level and registers the fork handler. The host is
/// responsible for adding [`wake_fd`] to its input-handler table.
///
/// # Errors
///
/// [`Error::InitFailed`] when the pipe cannot be created.
pub fn ensure_initialized() -> Result<(), Error> {
	main_thread::register_main_thread();
	main_thread::debug_assert_main_thread();
	if INITIALIZED.load(Ordering::Acquire) {
		return Ok(());
	}
	diagnostics::apply_current();
	let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
		.map_err(|errno| Error::InitFailed(io::Error::from_raw_os_error(errno as i32)))?;
	READ_FD.store(reader, Ordering::SeqCst);
	WRITE_FD.store(writer, Ordering::SeqCst);
	ATFORK.call_once(|| unsafe {
		let _ = nix::libc::pthread_atfork(None, None, Some(atfork_child));
	});
	RegistryTable::global().set_wakeup_hook(request_wakeup);
	INITIALIZED.store(true, Ordering::Release);
	log::info!("wake pipe initialised (read fd {reader})");
	Ok(())
}

/// The pipe's read end, for the host's input-handler table. `None` before
/// initialisation (and in a fork child before re-initialisation).
#[must_use]
pub fn wake_fd() -> Option<RawFd> {
	let fd = READ_FD.load(Ordering::SeqCst);
	(fd >= 0).then_some(fd)
}

/// Asks the driver to fire on or before `at_or_before`. Callable from any
/// thread; redundant requests collapse.
pub fn request_wakeup(at_or_before: Timestamp) {
	if !INITIALIZED.load(Ordering::Acquire) {
		return;
	}
	if at_or_before.in_future() {
		TIMER.set(at_or_before);
	} else {
		write_wake_byte();
	}
}

fn write_wake_byte() {
	if HOT.swap(true, Ordering::SeqCst) {
		return;
	}
	let fd = WRITE_FD.load(Ordering::SeqCst);
	if fd < 0 {
		HOT.store(false, Ordering::SeqCst);
		return;
	}
	if let Err(errno) = write(fd, b"a") {
		log::warn!("wake pipe write failed: {errno}");
		HOT.store(false, Ordering::SeqCst);
	}
}

/// Keeps the driver from firing while it exists.
pub struct WakeupPause(());

/// Pauses the driver, e.g. while the host is mid-stack. Nestable; the
/// driver fires again once every pause has been dropped.
#[must_use]
pub fn pause_wakeups() -> WakeupPause {
	PAUSED.fetch_add(1, Ordering::SeqCst);
	WakeupPause(())
}

impl Drop for WakeupPause {
	fn drop(&mut self) {
		PAUSED.fetch_sub(1, Ordering::SeqCst);
	}
}

/// The input-handler body: the host calls this when [`wake_fd`] polls
/// readable. Main thread only. Returns whether any callback ran.
pub fn handle_input_ready() -> bool {
	main_thread::debug_assert_main_thread();
	if !INITIALIZED.load(Ordering::Acquire) {
		return false;
	}
	if PAUSED.load(Ordering::SeqCst) > 0 || !dispatch::at_top_level() {
		// Not a safe point. The byte stays in the pipe, so the host's
		// input loop calls back in once it returns to the top level.
		return false;
	}
	// Cold before draining: work scheduled mid-dispatch writes a new byte.
	HOT.store(false, Ordering::SeqCst);
	drain_pipe();
	let _paused = pause_wakeups();
	// Re-arms even if a callback panics through the pump.
	let _rearm = scopeguard::guard((), |()| {
		if let Some(deadline) = RegistryTable::global().next_wakeup_deadline() {
			request_wakeup(deadline);
		}
	});
	dispatch::run_pump(RegistryTable::global())
}

fn drain_pipe() {
	let fd = READ_FD.load(Ordering::SeqCst);
	if fd < 0 {
		return;
	}
	let mut buf = [0_u8; 256];
	while matches!(read(fd, &mut buf), Ok(n) if n > 0) {}
}

/// Runs in the fork child with only the forking thread alive; must not
/// take locks.
extern "C" fn atfork_child() {
	let reader = READ_FD.swap(-1, Ordering::SeqCst);
	if reader >= 0 {
		let _ = close(reader);
	}
	let writer = WRITE_FD.swap(-1, Ordering::SeqCst);
	if writer >= 0 {
		let _ = close(writer);
	}
	HOT.store(false, Ordering::SeqCst);
	TIMER_RUNNING.store(false, Ordering::SeqCst);
	INITIALIZED.store(false, Ordering::SeqCst);
}

struct TimerState {
	wake_at: Option<Timestamp>,
}

/// One process-wide timer thread, started on first use. Sleeps until the
/// earliest requested deadline, then writes the wake byte.
struct WakeTimer {
	state: Mutex<TimerState>,
	cond: Condvar,
}

impl WakeTimer {
	const fn new() -> Self {
		Self {
			state: Mutex::new(TimerState { wake_at: None }),
			cond: Condvar::new(),
		}
	}

	fn set(&'static self, at: Timestamp) {
		if !TIMER_RUNNING.swap(true, Ordering::SeqCst) {
			let spawned = thread::Builder::new()
				.name("vernal-wake-timer".into())
				.spawn(move || self.run());
			if spawned.is_err() {
				TIMER_RUNNING.store(false, Ordering::SeqCst);
				log::warn!("wake timer thread refused; waking immediately");
				write_wake_byte();
				return;
			}
		}
		let mut state = self.state.lock();
		state.wake_at = Some(match state.wake_at {
			// Keep the earlier of the two deadlines.
			Some(current) if current <= at => current,
			_ => at,
		});
		self.cond.notify_all();
	}

	fn run(&self) {
		let mut state = self.state.lock();
		loop {
			while state.wake_at.is_none() {
				self.cond.wait(&mut state);
			}
			let at = state.wake_at.expect("wake deadline vanished");
			let lead = at.duration_from_now();
			if !lead.is_zero() {
				// Woken early means a new (possibly earlier) deadline was
				// set; go around and re-read it.
				if !self.cond.wait_for(&mut state, lead).timed_out() {
					continue;
				}
			}
			state.wake_at = None;
			parking_lot::MutexGuard::unlocked(&mut state, write_wake_byte);
		}
	}
}
