//! The process-wide table of event loops.
//!
//! [`RegistryTable`] owns the single [`SharedLock`] and maps host-visible
//! loop ids to registries. It is the thread-safe front door for scheduling:
//! any thread may resolve a loop id and insert work; everything else
//! (creation, pruning, deletion, cancellation) is main-thread only.
//!
//! The table tracks, per entry, whether the host still holds a reference to
//! the loop. A registry stays alive while either that reference is live or
//! the registry is a non-empty child reachable from a parent; `prune`
//! removes the rest.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use crate::callback::{Callback, CallbackId, HostWork, NativeFn, TaskWork};
use crate::dispatch;
use crate::error::Error;
use crate::main_thread;
use crate::registry::{LockGuard, QueueItem, Registry, SharedLock};
use crate::timestamp::Timestamp;

/// Host-visible loop identifier.
pub type LoopId = i32;

/// The always-present root loop, driven by the host's idle signal.
pub const GLOBAL_LOOP_ID: LoopId = 0;

/// Passed as `parent_id` to create a loop without a parent.
pub const NO_PARENT: LoopId = -1;

struct Entry {
	registry: Arc<Registry>,
	host_ref_alive: bool,
}

/// Process-wide mapping from loop id to registry.
pub struct RegistryTable {
	shared: Arc<SharedLock>,
	entries: RefCell<BTreeMap<LoopId, Entry>>,
	wakeup_hook: OnceCell<Box<dyn Fn(Timestamp) + Send + Sync>>,
}

/// # Safety
///
/// `entries` is only borrowed while the [`SharedLock`] is held, mirroring
/// the registries themselves; the hook cell requires `Send + Sync` contents.
unsafe impl Send for RegistryTable {}
unsafe impl Sync for RegistryTable {}

static GLOBAL: Lazy<RegistryTable> = Lazy::new(RegistryTable::new);

impl RegistryTable {
	/// A fresh table containing only the global loop.
	#[must_use]
	pub fn new() -> Self {
		let shared = Arc::new(SharedLock::new());
		let global = Registry::new(GLOBAL_LOOP_ID, Arc::clone(&shared));
		let mut entries = BTreeMap::new();
		entries.insert(
			GLOBAL_LOOP_ID,
			Entry {
				registry: global,
				host_ref_alive: true,
			},
		);
		Self {
			shared,
			entries: RefCell::new(entries),
			wakeup_hook: OnceCell::new(),
		}
	}

	/// The process singleton.
	#[must_use]
	pub fn global() -> &'static Self {
		&GLOBAL
	}

	/// Installs the hook fired when work lands in the global loop's forest.
	/// First caller wins; later calls are ignored.
	pub fn set_wakeup_hook(&self, hook: impl Fn(Timestamp) + Send + Sync + 'static) {
		let _ = self.wakeup_hook.set(Box::new(hook));
	}

	pub(crate) fn get_locked(&self, id: LoopId, _lock: &LockGuard<'_>) -> Option<Arc<Registry>> {
		self.entries
			.borrow()
			.get(&id)
			.map(|entry| Arc::clone(&entry.registry))
	}

	pub(crate) fn get(&self, id: LoopId) -> Option<Arc<Registry>> {
		let guard = self.shared.lock();
		self.get_locked(id, &guard)
	}

	/// Whether a loop with `id` is live. Thread-safe.
	#[must_use]
	pub fn exists(&self, id: LoopId) -> bool {
		self.get(id).is_some()
	}

	/// Creates a loop. Main thread only.
	///
	/// # Errors
	///
	/// [`Error::AlreadyExists`] when `id` is live, [`Error::ParentMissing`]
	/// when `parent_id >= 0` names no live loop.
	pub fn create(&self, id: LoopId, parent_id: LoopId) -> Result<(), Error> {
		main_thread::debug_assert_main_thread();
		let guard = self.shared.lock();
		if self.entries.borrow().contains_key(&id) {
			return Err(Error::AlreadyExists(id));
		}
		let parent = if parent_id >= 0 {
			Some(
				self.get_locked(parent_id, &guard)
					.ok_or(Error::ParentMissing(parent_id))?,
			)
		} else {
			None
		};
		let registry = Registry::new(id, Arc::clone(&self.shared));
		if let Some(parent) = &parent {
			Registry::link_child(parent, &registry, &guard);
		}
		self.entries.borrow_mut().insert(
			id,
			Entry {
				registry,
				host_ref_alive: true,
			},
		);
		log::debug!("created event loop {id} (parent {parent_id})");
		Ok(())
	}

	fn schedule(
		&self,
		loop_id: LoopId,
		delay_secs: f64,
		make: impl FnOnce(Timestamp) -> Callback,
	) -> Option<CallbackId> {
		let when = Timestamp::from_now(delay_secs);
		let guard = self.shared.lock();
		let registry = self.get_locked(loop_id, &guard)?;
		let id = registry.add(make(when), &guard);
		let wakes_host = registry.forest_root(&guard).id() == GLOBAL_LOOP_ID;
		drop(guard);
		if wakes_host {
			if let Some(hook) = self.wakeup_hook.get() {
				hook(when);
			}
		}
		Some(id)
	}

	/// Schedules a host callback. Main thread only (the host variant must
	/// not be constructed elsewhere). Returns `None` when the loop is gone.
	pub fn schedule_host(
		&self,
		loop_id: LoopId,
		work: HostWork,
		delay_secs: f64,
	) -> Option<CallbackId> {
		self.schedule(loop_id, delay_secs, |when| Callback::host(when, work))
	}

	/// Schedules owned `Send` work. Thread-safe.
	pub fn schedule_task(
		&self,
		loop_id: LoopId,
		work: TaskWork,
		delay_secs: f64,
	) -> Option<CallbackId> {
		self.schedule(loop_id, delay_secs, |when| Callback::task(when, work))
	}

	/// Schedules a native callback. Thread-safe. `data` is caller-owned and
	/// opaque to the scheduler.
	pub fn schedule_native(
		&self,
		loop_id: LoopId,
		func: NativeFn,
		data: *mut c_void,
		delay_secs: f64,
	) -> Option<CallbackId> {
		self.schedule(loop_id, delay_secs, |when| Callback::native(when, func, data))
	}

	/// Removes a queued callback before it runs. Main thread only.
	#[must_use]
	pub fn cancel(&self, callback_id: CallbackId, loop_id: LoopId) -> bool {
		main_thread::debug_assert_main_thread();
		let guard = self.shared.lock();
		self.get_locked(loop_id, &guard)
			.is_some_and(|registry| registry.cancel(callback_id, &guard))
	}

	/// Marks the host's reference to `id` as released and prunes. Main
	/// thread only. Returns whether the loop was known. The global loop's
	/// reference is permanent.
	pub fn notify_host_ref_released(&self, id: LoopId) -> bool {
		main_thread::debug_assert_main_thread();
		if id == GLOBAL_LOOP_ID {
			return false;
		}
		let known = {
			let _guard = self.shared.lock();
			match self.entries.borrow_mut().get_mut(&id) {
				Some(entry) => {
					entry.host_ref_alive = false;
					true
				}
				None => false,
			}
		};
		if known {
			self.prune();
		}
		known
	}

	/// Drops every registry whose host reference is gone and that is either
	/// drained or unreachable. Main thread only.
	///
	/// Removal unlinks the registry from its parent and orphans its
	/// children; orphaning can cascade, so this iterates to a fixpoint.
	/// Registries with outstanding fd-waits are never pruned.
	pub fn prune(&self) {
		main_thread::debug_assert_main_thread();
		let guard = self.shared.lock();
		loop {
			let victim = self.entries.borrow().iter().find_map(|(id, entry)| {
				let registry = &entry.registry;
				(!entry.host_ref_alive
					&& registry.fd_waits() == 0
					&& (registry.is_empty(&guard) || !registry.has_parent(&guard)))
				.then_some(*id)
			});
			let Some(id) = victim else { break };
			let entry = self
				.entries
				.borrow_mut()
				.remove(&id)
				.expect("pruned entry vanished");
			entry.registry.unlink_from_parent(&guard);
			entry.registry.orphan_children(&guard);
			log::debug!("pruned event loop {id}");
			// Dropping the entry discards its pending callbacks; scheduled
			// FFI callbacks referenced by them are dropped uninvoked.
		}
	}

	/// Deletes a loop outright. Main thread only.
	///
	/// # Errors
	///
	/// [`Error::InvalidState`] for the global loop and for the current loop.
	pub fn delete(&self, id: LoopId) -> Result<bool, Error> {
		main_thread::debug_assert_main_thread();
		if id == GLOBAL_LOOP_ID {
			return Err(Error::InvalidState("cannot delete the global loop"));
		}
		if id == dispatch::get_current_loop() {
			return Err(Error::InvalidState("cannot delete the current loop"));
		}
		let guard = self.shared.lock();
		let Some(entry) = self.entries.borrow_mut().remove(&id) else {
			return Ok(false);
		};
		entry.registry.unlink_from_parent(&guard);
		entry.registry.orphan_children(&guard);
		log::debug!("deleted event loop {id}");
		Ok(true)
	}

	/// Whether the loop has neither queued callbacks nor outstanding
	/// fd-waits.
	///
	/// # Errors
	///
	/// [`Error::NoSuchLoop`].
	pub fn idle(&self, id: LoopId) -> Result<bool, Error> {
		let guard = self.shared.lock();
		let registry = self.get_locked(id, &guard).ok_or(Error::NoSuchLoop(id))?;
		Ok(registry.is_empty(&guard))
	}

	/// Seconds until the next operation in the loop or its descendants;
	/// infinite when nothing is queued, negative when overdue.
	///
	/// # Errors
	///
	/// [`Error::NoSuchLoop`].
	pub fn next_op_secs(&self, id: LoopId) -> Result<f64, Error> {
		let guard = self.shared.lock();
		let registry = self.get_locked(id, &guard).ok_or(Error::NoSuchLoop(id))?;
		Ok(registry
			.next_deadline(true, &guard)
			.map_or(f64::INFINITY, |deadline| {
				deadline.diff_secs(Timestamp::now())
			}))
	}

	/// Snapshot of the loop's own queue for introspection. Main thread only.
	///
	/// # Errors
	///
	/// [`Error::NoSuchLoop`].
	pub fn list_queue(&self, id: LoopId) -> Result<Vec<QueueItem>, Error> {
		let guard = self.shared.lock();
		let registry = self.get_locked(id, &guard).ok_or(Error::NoSuchLoop(id))?;
		Ok(registry.list(&guard))
	}

	/// The earliest deadline anywhere in the global loop's forest; what the
	/// idle driver should re-arm to.
	#[must_use]
	pub fn next_wakeup_deadline(&self) -> Option<Timestamp> {
		let guard = self.shared.lock();
		let registry = self.get_locked(GLOBAL_LOOP_ID, &guard)?;
		registry.next_deadline(true, &guard)
	}
}

impl Default for RegistryTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::{RegistryTable, GLOBAL_LOOP_ID, NO_PARENT};
	use crate::error::Error;

	#[test]
	fn create_rejects_duplicates_and_missing_parents() {
		let table = RegistryTable::new();
		table.create(1, GLOBAL_LOOP_ID).expect("create failed");
		assert!(matches!(table.create(1, NO_PARENT), Err(Error::AlreadyExists(1))));
		assert!(matches!(table.create(2, 99), Err(Error::ParentMissing(99))));
		assert!(matches!(
			table.create(GLOBAL_LOOP_ID, NO_PARENT),
			Err(Error::AlreadyExists(GLOBAL_LOOP_ID))
		));
		assert!(table.exists(1));
		assert!(!table.exists(2));
	}

	#[test]
	fn schedule_into_a_missing_loop_returns_none() {
		let table = RegistryTable::new();
		assert!(table.schedule_task(42, Box::new(|| ()), 0.0).is_none());
		assert!(table
			.schedule_task(GLOBAL_LOOP_ID, Box::new(|| ()), 0.0)
			.is_some());
	}

	#[test]
	fn released_empty_loops_are_pruned() {
		let table = RegistryTable::new();
		table.create(5, GLOBAL_LOOP_ID).expect("create failed");
		assert!(table.notify_host_ref_released(5));
		assert!(!table.exists(5));
		// A second release is a no-op on an unknown loop.
		assert!(!table.notify_host_ref_released(5));
	}

	#[test]
	fn released_non_empty_children_survive_until_drained() {
		let table = RegistryTable::new();
		table.create(6, GLOBAL_LOOP_ID).expect("create failed");
		let id = table
			.schedule_task(6, Box::new(|| ()), 30.0)
			.expect("schedule failed");
		assert!(table.notify_host_ref_released(6));
		// Still reachable from the global loop and non-empty.
		assert!(table.exists(6));
		assert!(table.cancel(id, 6));
		table.prune();
		assert!(!table.exists(6));
	}

	#[test]
	fn released_parentless_loops_drop_their_queue() {
		let table = RegistryTable::new();
		table.create(7, NO_PARENT).expect("create failed");
		table
			.schedule_task(7, Box::new(|| ()), 30.0)
			.expect("schedule failed");
		assert!(table.notify_host_ref_released(7));
		// Unreachable, so pruned despite the queued callback.
		assert!(!table.exists(7));
	}

	#[test]
	fn delete_guards_the_global_loop() {
		let table = RegistryTable::new();
		assert!(matches!(
			table.delete(GLOBAL_LOOP_ID),
			Err(Error::InvalidState(_))
		));
		assert!(matches!(table.delete(12), Ok(false)));
		table.create(12, GLOBAL_LOOP_ID).expect("create failed");
		assert!(matches!(table.delete(12), Ok(true)));
		assert!(!table.exists(12));
	}

	#[test]
	fn next_op_secs_reports_the_earliest_deadline() {
		let table = RegistryTable::new();
		assert!(table
			.next_op_secs(GLOBAL_LOOP_ID)
			.expect("no global loop")
			.is_infinite());
		table
			.schedule_task(GLOBAL_LOOP_ID, Box::new(|| ()), 5.0)
			.expect("schedule failed");
		let secs = table.next_op_secs(GLOBAL_LOOP_ID).expect("no global loop");
		assert!(secs > 4.0 && secs <= 5.0);
		assert!(matches!(table.next_op_secs(404), Err(Error::NoSuchLoop(404))));
	}
}
