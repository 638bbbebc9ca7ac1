//! Control-protocol client.
//!
//! Talks to the monitor's control endpoint using newline-delimited json
//! documents. Each command is tagged with a request id, which the monitor
//! echoes in its reply. Events and greetings arriving while a reply is pending
//! are queued, so only one command is ever in flight.

// Modules
pub mod command;
pub mod response;

// Exports
pub use self::{
	command::{Command, CommandName},
	response::{Event, Response},
};

// Imports
use {
	crate::memory_map::{self, MemoryRegion},
	serde_json::Value,
	std::{
		io::{self, BufRead, Write},
		os::unix::net::UnixStream,
		path::{Path, PathBuf},
		thread,
		time::{Duration, Instant},
	},
};

/// Interval between connection attempts while the endpoint isn't up yet
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Control-protocol error
#[derive(Debug, thiserror::Error)]
pub enum QmpError {
	#[error("Unable to connect to control endpoint {path:?}")]
	Connect {
		path:   PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("Unable to encode command `{command}`")]
	Encode {
		command: CommandName,
		#[source]
		source:  serde_json::Error,
	},

	#[error("I/O error while executing `{command}`")]
	Io {
		command: CommandName,
		#[source]
		source:  io::Error,
	},

	#[error("Connection closed while waiting for reply to `{command}`")]
	Closed { command: CommandName },

	#[error("Timed out waiting for reply to `{command}`")]
	ReplyTimeout { command: CommandName },

	#[error("Command `{command}` failed: {class}: {desc}")]
	Protocol {
		command: CommandName,
		class:   String,
		desc:    String,
	},

	#[error("Unexpected response to `{command}`: {response:?}")]
	UnexpectedResponse { command: CommandName, response: Response },

	#[error("Unable to decode reply to `{command}`: {reason}")]
	Decode { command: CommandName, reason: String },
}

/// Control-protocol client
#[derive(Debug)]
pub struct QmpClient<S> {
	/// Stream
	///
	/// Reads go through the buffer, writes go directly to the inner stream.
	stream: io::BufReader<S>,

	/// Next request id
	next_id: u64,

	/// Events received while waiting for replies
	events: Vec<Event>,

	/// Time to wait for each reply, across all messages read while waiting
	reply_timeout: Option<Duration>,
}

impl QmpClient<UnixStream> {
	/// Connects to the control endpoint at `path`.
	///
	/// The endpoint is polled until it accepts a connection or `connect_timeout`
	/// elapses. Every reply is then waited on for at most `reply_timeout`, even
	/// if the monitor keeps sending events in the meantime.
	pub fn connect(path: &Path, connect_timeout: Duration, reply_timeout: Duration) -> Result<Self, QmpError> {
		let deadline = Instant::now() + connect_timeout;
		let stream = loop {
			match UnixStream::connect(path) {
				Ok(stream) => break stream,
				Err(err) if Instant::now() < deadline => {
					tracing::trace!(?path, ?err, "Control endpoint not up yet");
					thread::sleep(CONNECT_POLL_INTERVAL);
				},
				Err(source) => {
					return Err(QmpError::Connect {
						path: path.to_path_buf(),
						source,
					})
				},
			}
		};

		stream
			.set_read_timeout(Some(reply_timeout))
			.map_err(|source| QmpError::Connect {
				path: path.to_path_buf(),
				source,
			})?;
		tracing::debug!(?path, "Connected to control endpoint");

		Ok(Self::new(stream).with_reply_timeout(reply_timeout))
	}
}

impl<S: io::Read + io::Write> QmpClient<S> {
	/// Creates a client over an already connected stream.
	///
	/// Replies are waited on indefinitely, unless a reply timeout is set. Reads
	/// only observe the timeout between messages, so the stream itself should
	/// also have a read timeout.
	pub fn new(stream: S) -> Self {
		Self {
			stream:        io::BufReader::new(stream),
			next_id:       0,
			events:        vec![],
			reply_timeout: None,
		}
	}

	/// Sets the time to wait for each reply
	#[must_use]
	pub fn with_reply_timeout(self, reply_timeout: Duration) -> Self {
		Self {
			reply_timeout: Some(reply_timeout),
			..self
		}
	}

	/// Negotiates capabilities, leaving the greeting state
	pub fn handshake(&mut self) -> Result<(), QmpError> {
		self.send_expect_success(&Command::new(CommandName::Capabilities))?;
		Ok(())
	}

	/// Sends a command and returns its reply.
	///
	/// Error envelopes are returned as [`Response::Error`], not as `Err`.
	pub fn send(&mut self, command: &Command) -> Result<Response, QmpError> {
		let id = self.next_id;
		self.next_id += 1;

		let bytes = command.encode(id).map_err(|source| QmpError::Encode {
			command: command.name,
			source,
		})?;
		tracing::debug!("QMP[SEND]: {}", String::from_utf8_lossy(&bytes).trim_end());

		let io_err = |source| QmpError::Io {
			command: command.name,
			source,
		};
		let writer = self.stream.get_mut();
		writer.write_all(&bytes).map_err(io_err)?;
		writer.flush().map_err(io_err)?;

		self.read_reply(command.name, id)
	}

	/// Sends a command and returns the payload of its success reply
	pub fn send_expect_success(&mut self, command: &Command) -> Result<Value, QmpError> {
		match self.send(command)? {
			Response::Success { payload, .. } => Ok(payload),
			Response::Error { class, desc, .. } => Err(QmpError::Protocol {
				command: command.name,
				class,
				desc,
			}),
			response => Err(QmpError::UnexpectedResponse {
				command: command.name,
				response,
			}),
		}
	}

	/// Queries the guest-physical memory map
	pub fn query_memory_map(&mut self) -> Result<Vec<MemoryRegion>, QmpError> {
		let command = Command::new(CommandName::MemoryMap);
		let payload = self.send_expect_success(&command)?;

		let decode_err = |reason: String| QmpError::Decode {
			command: command.name,
			reason,
		};
		let regions = serde_json::from_value::<Vec<MemoryRegion>>(payload).map_err(|err| decode_err(err.to_string()))?;
		memory_map::validate(&regions).map_err(|err| decode_err(format!("{err:#}")))?;

		Ok(regions)
	}

	/// Queries the register dump of all cpus, as the human monitor prints it
	pub fn query_registers(&mut self) -> Result<String, QmpError> {
		let command = Command::new(CommandName::HumanMonitor).with_arg("command-line", "info registers -a");
		match self.send_expect_success(&command)? {
			Value::String(output) => Ok(output),
			payload => Err(QmpError::Decode {
				command: command.name,
				reason:  format!("Expected string output, found {payload}"),
			}),
		}
	}

	/// Pauses the guest
	pub fn pause(&mut self) -> Result<(), QmpError> {
		self.send_expect_success(&Command::new(CommandName::Stop))?;
		Ok(())
	}

	/// Resumes the guest
	pub fn resume(&mut self) -> Result<(), QmpError> {
		self.send_expect_success(&Command::new(CommandName::Cont))?;
		Ok(())
	}

	/// Saves guest-physical memory `[start, end)` to `path`.
	///
	/// `path` is interpreted by the monitor, and is overwritten if it exists.
	pub fn save_memory_range(&mut self, region: &MemoryRegion, path: &Path) -> Result<(), QmpError> {
		let command = Command::new(CommandName::PhysicalMemorySave)
			.with_arg("val", region.start)
			.with_arg("size", region.size())
			.with_arg("filename", path.to_string_lossy().into_owned());
		self.send_expect_success(&command)?;
		Ok(())
	}

	/// Enables or disables trace event `name`
	pub fn set_trace_event(&mut self, name: &str, enabled: bool) -> Result<(), QmpError> {
		let command = Command::new(CommandName::TraceEventSetState)
			.with_arg("name", name)
			.with_arg("enable", enabled);
		self.send_expect_success(&command)?;
		Ok(())
	}

	/// Takes all events received so far
	pub fn take_events(&mut self) -> Vec<Event> {
		std::mem::take(&mut self.events)
	}

	/// Reads until the reply to request `id` arrives.
	///
	/// Replies without an id are accepted, since there's never more than one
	/// request pending. Events, greetings and stale replies don't extend the
	/// reply timeout.
	fn read_reply(&mut self, command: CommandName, id: u64) -> Result<Response, QmpError> {
		let deadline = self.reply_timeout.map(|timeout| Instant::now() + timeout);
		let mut line = String::new();
		loop {
			if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
				return Err(QmpError::ReplyTimeout { command });
			}

			line.clear();
			match self.stream.read_line(&mut line) {
				Ok(0) => return Err(QmpError::Closed { command }),
				Ok(_) => (),
				Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
					return Err(QmpError::ReplyTimeout { command })
				},
				Err(source) => return Err(QmpError::Io { command, source }),
			}

			let document = line.trim();
			if document.is_empty() {
				continue;
			}
			tracing::debug!("QMP[RECV]: {document}");

			let response = Response::decode(document).map_err(|err| QmpError::Decode {
				command,
				reason: err.to_string(),
			})?;
			match response {
				Response::Event(event) => {
					tracing::debug!(name = %event.name, timestamp = ?event.timestamp, "Queued event");
					self.events.push(event);
				},
				Response::Greeting(greeting) => tracing::debug!(%greeting, "Received greeting"),
				response => match response.id() {
					Some(reply_id) if reply_id != id => {
						tracing::warn!(%command, id, reply_id, "Discarding reply to another request");
					},
					_ => return Ok(response),
				},
			}
		}
	}
}
