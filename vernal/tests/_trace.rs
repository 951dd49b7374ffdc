use std::{fmt::Debug, sync::Mutex};

/// Order log for dispatched callbacks.
///
/// Callbacks call [`record`](Self::record) as they run;
/// [`assert_order`](Self::assert_order) takes the whole log and compares it
/// in one shot, so each assertion covers exactly the activity since the
/// previous one.
pub struct Trace<T>(Mutex<Vec<T>>);

impl<T> Trace<T> {
	pub const fn new() -> Self {
		Self(Mutex::new(Vec::new()))
	}

	pub fn record(&self, entry: T) {
		self.0.lock().expect("trace poisoned").push(entry);
	}

	#[track_caller]
	pub fn assert_order(&self, expected: impl IntoIterator<Item = T>)
	where
		T: Debug + PartialEq,
	{
		let recorded = std::mem::take(&mut *self.0.lock().expect("trace poisoned"));
		let expected: Vec<T> = expected.into_iter().collect();
		assert_eq!(recorded, expected);
	}
}
