//! Commands

// Imports
use {
	serde_json::{Map, Value},
	std::fmt,
};

/// Command name.
///
/// Only the commands the experiment needs are supported.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum CommandName {
	/// Capability negotiation, leaves the greeting state
	Capabilities,

	/// Pauses all guest cpus
	Stop,

	/// Resumes all guest cpus
	Cont,

	/// Saves a range of guest-physical memory to a file
	PhysicalMemorySave,

	/// Toggles a trace event
	TraceEventSetState,

	/// Queries the guest-physical memory map
	MemoryMap,

	/// Runs a human monitor command and returns its output
	HumanMonitor,
}

impl CommandName {
	/// Returns the name of this command on the wire
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Capabilities => "qmp_capabilities",
			Self::Stop => "stop",
			Self::Cont => "cont",
			Self::PhysicalMemorySave => "pmemsave",
			Self::TraceEventSetState => "trace-event-set-state",
			Self::MemoryMap => "e820-info",
			Self::HumanMonitor => "human-monitor-command",
		}
	}
}

impl fmt::Display for CommandName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.pad(self.as_str())
	}
}

/// Command
#[derive(Clone, Debug)]
pub struct Command {
	/// Name
	pub name: CommandName,

	/// Arguments, if any
	pub arguments: Option<Map<String, Value>>,
}

impl Command {
	/// Creates a command without arguments
	pub fn new(name: CommandName) -> Self {
		Self { name, arguments: None }
	}

	/// Adds an argument to this command
	#[must_use]
	pub fn with_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
		self.arguments
			.get_or_insert_with(Map::new)
			.insert(name.to_owned(), value.into());
		self
	}

	/// Encodes this command with request id `id`.
	///
	/// The encoded document is terminated by a newline.
	pub fn encode(&self, id: u64) -> Result<Vec<u8>, serde_json::Error> {
		#[derive(serde::Serialize)]
		struct Wire<'a> {
			execute:   &'a str,
			#[serde(skip_serializing_if = "Option::is_none")]
			arguments: Option<&'a Map<String, Value>>,
			id:        u64,
		}

		let mut bytes = serde_json::to_vec(&Wire {
			execute:   self.name.as_str(),
			arguments: self.arguments.as_ref(),
			id,
		})?;
		bytes.push(b'\n');

		Ok(bytes)
	}
}
