//! Utilities

// Modules
pub mod logger;

// Imports
use {
	itertools::Itertools,
	std::{cell::RefCell, fmt, process::Command},
};

/// Extension trait for [`Command`] to render the command line it will run
#[extend::ext(name = CommandLine)]
pub impl Command {
	/// Returns the program and all of its arguments, separated by spaces.
	///
	/// Arguments are displayed lossily, since this is only meant for logs.
	fn command_line(&self) -> String {
		std::iter::once(self.get_program())
			.chain(self.get_args())
			.map(|arg| arg.to_string_lossy())
			.join(" ")
	}
}

/// [`fmt::Display`] helper to display using a `FnMut(&mut fmt::Formatter)`
pub struct DisplayWrapper<F: FnMut(&mut fmt::Formatter) -> fmt::Result>(RefCell<F>);

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> DisplayWrapper<F> {
	/// Creates a new display wrapper
	#[must_use]
	pub const fn new(func: F) -> Self {
		Self(RefCell::new(func))
	}
}

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> fmt::Display for DisplayWrapper<F> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		// Note: `f` cannot be re-entrant, so this cannot fail
		self.0.borrow_mut()(f)
	}
}
