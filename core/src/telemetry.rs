use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt, reload};

/// Process start time, used to report how long readiness tasks took.
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static LOG_HANDLE: OnceCell<FilterHandle> = OnceCell::new();

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

impl FromStr for LogFormat {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"json" => Ok(LogFormat::Json),
			"plain" | "text" => Ok(LogFormat::Plain),
			other => Err(Error::InvalidFormat(other.to_string())),
		}
	}
}

/// Installs the global tracing subscriber. Returns a `WorkerGuard` that must be held for
/// the lifetime of the process to keep the non-blocking writer flushing.
///
/// Log level is sourced from `RUST_LOG` (default `info`) and can be changed at runtime via
/// [`set_level`]. Log format is sourced from the `format` argument, normally populated from
/// `--log-format`/`SENTRYGATE_LOG_FORMAT`.
pub fn setup_logging(format: LogFormat) -> tracing_appender::non_blocking::WorkerGuard {
	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let (filter, handle) = reload::Layer::new(filter);
	let _ = LOG_HANDLE.set(handle);

	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Json => {
			registry
				.with(fmt::layer().json().with_writer(non_blocking).with_ansi(false))
				.init();
		},
		LogFormat::Plain => {
			registry
				.with(fmt::layer().with_writer(non_blocking).with_ansi(false))
				.init();
		},
	}
	guard
}

/// Replaces the active log filter directive, e.g. `"debug"` or `"sentrygate::proxy=trace,info"`.
pub fn set_level(directive: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	let new_filter = EnvFilter::try_new(directive)?;
	handle.reload(new_filter)?;
	Ok(())
}

pub fn get_current_loglevel() -> Result<String, Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	Ok(handle.with_current(|f| f.to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("invalid log format: {0}")]
	InvalidFormat(String),
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}
