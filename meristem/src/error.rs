//! Error taxonomy for the scheduling surface and the dispatch barrier.

use std::io;

use thiserror::Error;

use crate::table::LoopId;

/// Operational errors on the scheduling API surface.
///
/// These are reported to the caller and leave the runtime state unchanged
/// beyond what the individual operation documents.
#[derive(Debug, Error)]
pub enum Error {
	/// `create` was asked for a loop id that is already live.
	#[error("event loop {0} already exists")]
	AlreadyExists(LoopId),

	/// An operation named a loop id with no live registry.
	#[error("no event loop with id {0}")]
	NoSuchLoop(LoopId),

	/// `create` named a parent loop that does not exist.
	#[error("parent loop {0} does not exist")]
	ParentMissing(LoopId),

	/// The operation is not valid in the current runtime state.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// The OS refused to start a worker thread.
	#[error("failed to spawn worker thread: {0}")]
	ThreadCreateFailed(#[source] io::Error),

	/// The wake pipe could not be created.
	#[error("failed to initialise the wake pipe: {0}")]
	InitFailed(#[source] io::Error),
}

/// What went wrong inside a single dispatched callback.
///
/// Caught at the dispatcher boundary, reported through the `log` facade, and
/// never allowed to drop sibling callbacks.
#[derive(Debug, Error)]
pub enum CallbackError {
	/// A host-level interrupt arrived while the callback was running.
	#[error("interrupted")]
	Interrupted,

	/// The host reported an error from inside the callback.
	#[error("host error: {0}")]
	Host(String),

	/// The callback panicked (or a native callback misbehaved).
	#[error("native error: {0}")]
	Native(String),

	/// Host code left the callback through a non-exceptional control-flow
	/// jump; the dispatcher treats this like a host error.
	#[error("non-exceptional control flow out of a host callback")]
	ControlFlow,
}
