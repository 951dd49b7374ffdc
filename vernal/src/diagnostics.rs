//! The runtime's single configuration knob: a log level.
//!
//! Diagnostics, including errors caught at the dispatch barrier, go
//! through the `log` facade. The knob owns the process-wide `log` filter,
//! the way an embedded runtime owns its process's logging; embedders
//! needing finer control can adjust `log` state themselves afterwards.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use log::LevelFilter;
use tap::Pipe;

/// Verbosity of runtime diagnostics. Default: [`LogLevel::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
	/// No diagnostics at all.
	Off = 0,
	/// Failed callbacks and broken invariants.
	Error = 1,
	/// Dropped completions and other recoverable oddities.
	Warn = 2,
	/// Driver lifecycle events.
	Info = 3,
	/// Loop creation, pruning and scheduling detail.
	Debug = 4,
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error as u8);

impl LogLevel {
	fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Off,
			1 => Self::Error,
			2 => Self::Warn,
			3 => Self::Info,
			_ => Self::Debug,
		}
	}

	fn to_filter(self) -> LevelFilter {
		match self {
			Self::Off => LevelFilter::Off,
			Self::Error => LevelFilter::Error,
			Self::Warn => LevelFilter::Warn,
			Self::Info => LevelFilter::Info,
			Self::Debug => LevelFilter::Debug,
		}
	}

	fn as_str(self) -> &'static str {
		match self {
			Self::Off => "OFF",
			Self::Error => "ERROR",
			Self::Warn => "WARN",
			Self::Info => "INFO",
			Self::Debug => "DEBUG",
		}
	}
}

impl Display for LogLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Returned by [`LogLevel::from_str`] for anything that is not
/// OFF/ERROR/WARN/INFO/DEBUG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownLogLevel;

impl Display for UnknownLogLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str("unknown log level (expected OFF, ERROR, WARN, INFO or DEBUG)")
	}
}

impl std::error::Error for UnknownLogLevel {}

impl FromStr for LogLevel {
	type Err = UnknownLogLevel;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"OFF" => Ok(Self::Off),
			"ERROR" => Ok(Self::Error),
			"WARN" => Ok(Self::Warn),
			"INFO" => Ok(Self::Info),
			"DEBUG" => Ok(Self::Debug),
			_ => Err(UnknownLogLevel),
		}
	}
}

/// Reads, and with `Some(level)` replaces, the runtime log level,
/// returning the previous value.
pub fn log_level(new: Option<LogLevel>) -> LogLevel {
	let previous = LogLevel::from_raw(LEVEL.load(Ordering::SeqCst));
	if let Some(level) = new {
		LEVEL.store(level as u8, Ordering::SeqCst);
		level.to_filter().pipe(log::set_max_level);
	}
	previous
}

/// Applies the stored level to the `log` facade; run at initialisation.
pub(crate) fn apply_current() {
	LogLevel::from_raw(LEVEL.load(Ordering::SeqCst))
		.to_filter()
		.pipe(log::set_max_level);
}
