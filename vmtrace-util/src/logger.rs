//! Logger
//!
//! Logs to stderr, filtered by `RUST_LOG` (default `info`), and optionally to
//! a file, filtered by `RUST_LOG_FILE` (default `debug`).

// Imports
use {
	std::{
		fs,
		path::Path,
		sync::Arc,
	},
	tracing::metadata::LevelFilter,
	tracing_subscriber::{prelude::*, EnvFilter},
};

/// Pre-initialization logging.
///
/// Messages logged here are kept until [`init`](super::init) is called, at which
/// point they're emitted through `tracing`.
pub mod pre_init {
	// Imports
	use std::sync::Mutex;

	/// Buffered messages
	pub(super) static MESSAGES: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

	/// Buffered message level
	#[derive(Clone, Copy, Debug)]
	pub(super) enum Level {
		Debug,
		Warn,
	}

	/// Buffers a debug message
	pub fn debug(msg: impl Into<String>) {
		self::push(Level::Debug, msg.into());
	}

	/// Buffers a warning message
	pub fn warn(msg: impl Into<String>) {
		self::push(Level::Warn, msg.into());
	}

	fn push(level: Level, msg: String) {
		// Note: If the lock is poisoned, we still want the message
		let mut messages = MESSAGES.lock().unwrap_or_else(|err| err.into_inner());
		messages.push((level, msg));
	}
}

/// Initializes the logger.
///
/// If `log_file` is `Some`, also logs to it, appending instead of truncating if
/// `log_file_append` is set.
///
/// # Panics
/// Panics if called more than once.
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	// Create the terminal layer
	let term_layer = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.with_filter(self::env_filter("RUST_LOG", LevelFilter::INFO));

	// Then try to create the file layer, if requested
	let mut file_err = None;
	let file_layer = log_file.and_then(|log_file| {
		let file = match log_file_append {
			true => fs::OpenOptions::new().create(true).append(true).open(log_file),
			false => fs::File::create(log_file),
		};

		match file {
			Ok(file) => Some(
				tracing_subscriber::fmt::layer()
					.with_ansi(false)
					.with_writer(Arc::new(file))
					.with_filter(self::env_filter("RUST_LOG_FILE", LevelFilter::DEBUG)),
			),
			Err(err) => {
				file_err = Some((log_file.to_path_buf(), err));
				None
			},
		}
	});

	tracing_subscriber::registry().with(term_layer).with(file_layer).init();

	if let Some((path, err)) = file_err {
		tracing::warn!(?path, ?err, "Unable to create log file");
	}

	// Finally emit all pre-init messages
	let messages = std::mem::take(&mut *pre_init::MESSAGES.lock().unwrap_or_else(|err| err.into_inner()));
	for (level, msg) in messages {
		match level {
			pre_init::Level::Debug => tracing::debug!(target: "vmtrace::pre_init", "{msg}"),
			pre_init::Level::Warn => tracing::warn!(target: "vmtrace::pre_init", "{msg}"),
		}
	}
}

/// Creates an env filter from `var`, falling back to `default` if unset or invalid
fn env_filter(var: &str, default: LevelFilter) -> EnvFilter {
	EnvFilter::builder()
		.with_default_directive(default.into())
		.with_env_var(var)
		.from_env_lossy()
}
