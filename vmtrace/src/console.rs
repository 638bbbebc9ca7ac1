//! Interactive line session driver.
//!
//! Drives the guest's console: lines are sent, and output is matched against
//! patterns, with every wait bounded by a timeout.

// Imports
use {
	regex::Regex,
	std::{
		fmt,
		io::{self, Write},
		os::fd::AsRawFd,
		time::{Duration, Instant},
	},
};

/// Maximum number of unmatched bytes kept around.
///
/// Older output is discarded, keeping only the tail, so a chatty guest can't grow
/// the buffer without bound while we wait for a prompt.
const MAX_BUFFERED: usize = 64 * 1024;

/// Session error
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("Timed out after {timeout:?} waiting for {pattern}")]
	Timeout { pattern: String, timeout: Duration },

	#[error("Session closed while waiting for {pattern}")]
	Closed { pattern: String },

	#[error("I/O error on session")]
	Io(#[source] io::Error),
}

/// Pattern to wait for
#[derive(Clone, Debug)]
pub enum Pattern {
	/// Literal substring
	Literal(String),

	/// Regular expression
	Regex(Regex),
}

impl Pattern {
	/// Finds the first match in `haystack`, returning its range
	fn find(&self, haystack: &str) -> Option<(usize, usize)> {
		match self {
			Self::Literal(literal) => haystack.find(literal.as_str()).map(|start| (start, start + literal.len())),
			Self::Regex(regex) => regex.find(haystack).map(|m| (m.start(), m.end())),
		}
	}
}

impl From<&str> for Pattern {
	fn from(literal: &str) -> Self {
		Self::Literal(literal.to_owned())
	}
}

impl fmt::Display for Pattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Literal(literal) => write!(f, "{literal:?}"),
			Self::Regex(regex) => write!(f, "/{}/", regex.as_str()),
		}
	}
}

/// Line-oriented interactive session
pub trait LineSession {
	/// Sends `line`, followed by a line terminator
	fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

	/// Waits until `pattern` appears in the output, for at most `timeout`.
	///
	/// Returns all output up to and including the match. Output before the
	/// match is consumed.
	fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String, SessionError>;

	/// Sends `line` and waits for `pattern`
	fn run(&mut self, line: &str, pattern: &Pattern, timeout: Duration) -> Result<String, SessionError> {
		self.send_line(line)?;
		self.expect(pattern, timeout)
	}
}

/// Console session over a readable and a writable stream.
///
/// The reader must be pollable, such as a pipe or socket.
#[derive(Debug)]
pub struct ConsoleSession<R, W> {
	/// Output of the console
	reader: R,

	/// Input of the console
	writer: W,

	/// Output received, but not yet matched
	buffer: String,

	/// Trailing bytes of an incomplete utf-8 sequence, completed by a later read
	pending: Vec<u8>,
}

impl<R: io::Read + AsRawFd, W: io::Write> ConsoleSession<R, W> {
	/// Creates a new session
	pub fn new(reader: R, writer: W) -> Self {
		Self {
			reader,
			writer,
			buffer:  String::new(),
			pending: Vec::new(),
		}
	}

	/// Appends raw output to the buffer.
	///
	/// Invalid sequences are replaced, but an incomplete sequence at the end is
	/// kept until more output arrives.
	fn push_output(&mut self, bytes: &[u8]) {
		self.pending.extend_from_slice(bytes);

		let mut rest = self.pending.as_slice();
		loop {
			match std::str::from_utf8(rest) {
				Ok(valid) => {
					self.buffer.push_str(valid);
					rest = &[];
					break;
				},
				Err(err) => {
					let (valid, invalid) = rest.split_at(err.valid_up_to());
					self.buffer.push_str(&String::from_utf8_lossy(valid));
					match err.error_len() {
						Some(len) => {
							self.buffer.push(char::REPLACEMENT_CHARACTER);
							rest = &invalid[len..];
						},
						None => {
							rest = invalid;
							break;
						},
					}
				},
			}
		}

		let consumed = self.pending.len() - rest.len();
		self.pending.drain(..consumed);
	}

	/// Waits until the reader is readable, for at most `timeout`.
	///
	/// Returns whether it became readable.
	fn wait_readable(&self, timeout: Duration) -> Result<bool, io::Error> {
		let mut poll_fd = libc::pollfd {
			fd:      self.reader.as_raw_fd(),
			events:  libc::POLLIN,
			revents: 0,
		};
		let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

		loop {
			// SAFETY: `poll_fd` is a single, valid `pollfd` that lives for the call.
			let res = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
			match res {
				-1 => match io::Error::last_os_error() {
					err if err.kind() == io::ErrorKind::Interrupted => continue,
					err => return Err(err),
				},
				0 => return Ok(false),
				// Note: Hang-ups and errors count as readable, so the following read reports them
				_ => return Ok(true),
			}
		}
	}

	/// Drops the oldest buffered output, keeping at most [`MAX_BUFFERED`] bytes
	fn trim_buffer(&mut self) {
		if self.buffer.len() <= MAX_BUFFERED {
			return;
		}

		let mut cut = self.buffer.len() - MAX_BUFFERED;
		while !self.buffer.is_char_boundary(cut) {
			cut += 1;
		}
		self.buffer.drain(..cut);
	}
}

impl<R: io::Read + AsRawFd, W: io::Write> LineSession for ConsoleSession<R, W> {
	fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
		tracing::debug!(?line, "Sending line");
		self.writer.write_all(line.as_bytes()).map_err(SessionError::Io)?;
		self.writer.write_all(b"\n").map_err(SessionError::Io)?;
		self.writer.flush().map_err(SessionError::Io)?;

		Ok(())
	}

	fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String, SessionError> {
		tracing::debug!(%pattern, ?timeout, "Waiting for pattern");
		let deadline = Instant::now() + timeout;
		let mut chunk = [0; 4096];
		loop {
			// Check if we already have it
			if let Some((_, end)) = pattern.find(&self.buffer) {
				let matched = self.buffer.drain(..end).collect::<String>();
				return Ok(matched);
			}
			self.trim_buffer();

			// Else wait for more output
			let remaining = deadline.saturating_duration_since(Instant::now());
			let timeout_err = || SessionError::Timeout {
				pattern: pattern.to_string(),
				timeout,
			};
			if remaining.is_zero() {
				return Err(timeout_err());
			}
			if !self.wait_readable(remaining).map_err(SessionError::Io)? {
				return Err(timeout_err());
			}

			let len = match self.reader.read(&mut chunk) {
				Ok(0) => {
					return Err(SessionError::Closed {
						pattern: pattern.to_string(),
					})
				},
				Ok(len) => len,
				Err(err) if matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => continue,
				Err(err) => return Err(SessionError::Io(err)),
			};

			tracing::trace!(target: "vmtrace::console", "{}", String::from_utf8_lossy(&chunk[..len]));
			self.push_output(&chunk[..len]);
		}
	}
}
