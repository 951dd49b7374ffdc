//! Per-loop callback registries.
//!
//! A [`Registry`] is one event loop: an ordered multiset of pending
//! callbacks, links to its parent and children, and a count of outstanding
//! fd-waits. Registries form a forest; dispatch drains a registry and then
//! recurses into its children.
//!
//! # Locking
//!
//! One process-wide mutex/condition-variable pair ([`SharedLock`]) protects
//! the registry table and every registry in it. Signalling travels from any
//! scheduling thread up to the main thread; polling recurses down through
//! children. A single lock makes both directions safe without a lock-order
//! protocol, and the critical sections are short (queue mutation, deadline
//! reads).
//!
//! Mutable registry state therefore lives in `RefCell`s that are only
//! borrowed while that one lock is held; the `&LockGuard<'_>` parameters on
//! the accessors are the witness. [`Registry::wait`] is the only operation
//! that blocks.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::callback::{Callback, CallbackId};
use crate::main_thread;
use crate::table::LoopId;
use crate::timestamp::{secs_to_duration, Timestamp};

/// Upper bound on one condition-variable sleep, so the main thread stays
/// responsive to host interrupts while waiting.
const MAX_WAIT_SLICE_SECS: f64 = 2.0;

/// Negative and non-finite wait budgets clamp to this many seconds.
const WAIT_FOREVER_SECS: f64 = 1e30;

/// The single lock shared by the registry table and every registry.
pub(crate) struct SharedLock {
	mutex: Mutex<()>,
	cond: Condvar,
}

/// Proof that the shared lock is held.
pub(crate) type LockGuard<'a> = MutexGuard<'a, ()>;

impl SharedLock {
	pub(crate) const fn new() -> Self {
		Self {
			mutex: Mutex::new(()),
			cond: Condvar::new(),
		}
	}

	pub(crate) fn lock(&self) -> LockGuard<'_> {
		self.mutex.lock()
	}

	/// Wakes every waiter; called after queue insertions.
	pub(crate) fn notify(&self) {
		self.cond.notify_all();
	}
}

/// A snapshot entry describing one queued callback, for introspection.
#[derive(Clone, Debug)]
pub struct QueueItem {
	/// The callback's identity (cancellation token).
	pub id: CallbackId,
	/// Seconds until the callback is due; negative when overdue.
	pub secs: f64,
	/// `"host"`, `"task"` or `"native"`.
	pub kind: &'static str,
}

struct RegistryInner {
	queue: BTreeSet<Callback>,
	parent: Weak<Registry>,
	children: Vec<Arc<Registry>>,
}

/// One event loop.
pub(crate) struct Registry {
	id: LoopId,
	shared: Arc<SharedLock>,
	fd_waits: AtomicUsize,
	inner: RefCell<RegistryInner>,
}

/// # Safety
///
/// `inner` is only ever borrowed while the process-wide [`SharedLock`] is
/// held (every accessor takes a `&LockGuard<'_>` witness), so the `RefCell`
/// is never raced. `fd_waits` is atomic. The non-`Send` contents of queued
/// callbacks carry their own contract (see [`Callback`]).
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
	pub(crate) fn new(id: LoopId, shared: Arc<SharedLock>) -> Arc<Self> {
		Arc::new(Self {
			id,
			shared,
			fd_waits: AtomicUsize::new(0),
			inner: RefCell::new(RegistryInner {
				queue: BTreeSet::new(),
				parent: Weak::new(),
				children: Vec::new(),
			}),
		})
	}

	pub(crate) fn id(&self) -> LoopId {
		self.id
	}

	pub(crate) fn lock(&self) -> LockGuard<'_> {
		self.shared.lock()
	}

	/// Inserts `cb` and wakes any waiter. The caller provides the guard, so
	/// insertion and any follow-up reads stay in one critical section.
	pub(crate) fn add(&self, cb: Callback, _lock: &LockGuard<'_>) -> CallbackId {
		let id = cb.id();
		self.inner.borrow_mut().queue.insert(cb);
		self.shared.notify();
		id
	}

	/// Removes the callback with `id`, if present. Main thread only: host
	/// callbacks own host state, which must not be dropped elsewhere.
	pub(crate) fn cancel(&self, id: CallbackId, _lock: &LockGuard<'_>) -> bool {
		main_thread::debug_assert_main_thread();
		let mut inner = self.inner.borrow_mut();
		let before = inner.queue.len();
		inner.queue.retain(|cb| cb.id() != id);
		inner.queue.len() != before
	}

	/// The earliest deadline in this registry (and, recursively, its
	/// descendants).
	pub(crate) fn next_deadline(&self, recursive: bool, lock: &LockGuard<'_>) -> Option<Timestamp> {
		let inner = self.inner.borrow();
		let mut next = inner.queue.first().map(Callback::when);
		if recursive {
			for child in &inner.children {
				next = match (next, child.next_deadline(true, lock)) {
					(Some(a), Some(b)) => Some(a.min(b)),
					(a, b) => a.or(b),
				};
			}
		}
		next
	}

	/// Whether anything is ready to run at `now`.
	pub(crate) fn due(&self, now: Timestamp, recursive: bool, lock: &LockGuard<'_>) -> bool {
		self.next_deadline(recursive, lock)
			.is_some_and(|deadline| deadline <= now)
	}

	/// Removes and returns the head of the own queue if it is due at `now`.
	/// Does not recurse.
	pub(crate) fn pop(&self, now: Timestamp, _lock: &LockGuard<'_>) -> Option<Callback> {
		let mut inner = self.inner.borrow_mut();
		if inner.queue.first().is_some_and(|cb| cb.when() <= now) {
			inner.queue.pop_first()
		} else {
			None
		}
	}

	/// Empty means: no queued callbacks and no outstanding fd-waits.
	pub(crate) fn is_empty(&self, _lock: &LockGuard<'_>) -> bool {
		self.inner.borrow().queue.is_empty() && self.fd_waits.load(Ordering::SeqCst) == 0
	}

	/// Snapshot of the queued callbacks for introspection. Main thread only.
	pub(crate) fn list(&self, _lock: &LockGuard<'_>) -> Vec<QueueItem> {
		main_thread::debug_assert_main_thread();
		let now = Timestamp::now();
		self.inner
			.borrow()
			.queue
			.iter()
			.map(|cb| QueueItem {
				id: cb.id(),
				secs: cb.when().diff_secs(now),
				kind: cb.kind(),
			})
			.collect()
	}

	pub(crate) fn fd_waits_incr(&self) {
		self.fd_waits.fetch_add(1, Ordering::SeqCst);
	}

	pub(crate) fn fd_waits_decr(&self) {
		let prev = self.fd_waits.fetch_sub(1, Ordering::SeqCst);
		debug_assert!(prev > 0, "fd-wait counter underflow");
	}

	pub(crate) fn fd_waits(&self) -> usize {
		self.fd_waits.load(Ordering::SeqCst)
	}

	/// Children in insertion order (the order dispatch visits them).
	pub(crate) fn children(&self, _lock: &LockGuard<'_>) -> Vec<Arc<Registry>> {
		self.inner.borrow().children.clone()
	}

	pub(crate) fn has_parent(&self, _lock: &LockGuard<'_>) -> bool {
		self.inner.borrow().parent.strong_count() > 0
	}

	/// Walks parent links to the root of this registry's forest.
	pub(crate) fn forest_root(self: &Arc<Self>, _lock: &LockGuard<'_>) -> Arc<Self> {
		let mut current = Arc::clone(self);
		loop {
			let parent = current.inner.borrow().parent.upgrade();
			match parent {
				Some(parent) => current = parent,
				None => return current,
			}
		}
	}

	/// Appends `child` to `parent`'s children and records the back link.
	pub(crate) fn link_child(parent: &Arc<Self>, child: &Arc<Self>, _lock: &LockGuard<'_>) {
		child.inner.borrow_mut().parent = Arc::downgrade(parent);
		parent.inner.borrow_mut().children.push(Arc::clone(child));
	}

	/// Severs this registry from its parent's child list, if any.
	pub(crate) fn unlink_from_parent(&self, _lock: &LockGuard<'_>) {
		let parent = {
			let mut inner = self.inner.borrow_mut();
			let parent = inner.parent.upgrade();
			inner.parent = Weak::new();
			parent
		};
		if let Some(parent) = parent {
			parent
				.inner
				.borrow_mut()
				.children
				.retain(|c| !std::ptr::eq(Arc::as_ptr(c), self));
		}
	}

	/// Clears the parent pointer of every child and drops the strong links.
	pub(crate) fn orphan_children(&self, _lock: &LockGuard<'_>) {
		let children = std::mem::take(&mut self.inner.borrow_mut().children);
		for child in children {
			child.inner.borrow_mut().parent = Weak::new();
		}
	}

	/// Blocks until something is due (own queue, or any descendant when
	/// `recursive`) or until `timeout_secs` elapses. Main thread only.
	///
	/// Negative and non-finite timeouts mean "wait indefinitely" (clamped to
	/// a large finite bound). Each individual sleep is capped at
	/// [`MAX_WAIT_SLICE_SECS`] and re-targets the earliest of the remaining
	/// budget and the next deadline.
	pub(crate) fn wait(&self, timeout_secs: f64, recursive: bool) -> bool {
		main_thread::debug_assert_main_thread();
		let budget = if timeout_secs.is_finite() && timeout_secs >= 0.0 {
			timeout_secs
		} else {
			WAIT_FOREVER_SECS
		};
		let start = Timestamp::now();
		let mut guard = self.shared.lock();
		loop {
			let now = Timestamp::now();
			if self.due(now, recursive, &guard) {
				return true;
			}
			let mut remaining = budget - now.diff_secs(start);
			if remaining <= 0.0 {
				return false;
			}
			if let Some(deadline) = self.next_deadline(recursive, &guard) {
				remaining = remaining.min(deadline.diff_secs(now).max(0.0));
			}
			let slice = secs_to_duration(remaining.min(MAX_WAIT_SLICE_SECS));
			self.shared.cond.wait_for(&mut guard, slice);
		}
	}
}
