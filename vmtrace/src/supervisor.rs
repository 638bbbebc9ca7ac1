//! External process supervisor.
//!
//! Every process is started in its own process group, and the whole group is
//! signalled on termination. Processes are terminated exactly once, in reverse
//! order of launch, either explicitly or when the supervisor is dropped.

// Imports
use {
	crate::config::Config,
	nix::{
		errno::Errno,
		sys::signal::{self, Signal},
		unistd::Pid,
	},
	std::{
		io,
		os::unix::process::CommandExt,
		process::{Child, Command, ExitStatus},
		thread,
		time::{Duration, Instant},
	},
	vmtrace_util::CommandLine,
};

/// Time given to a process to exit after being signalled
const TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// Interval between checks for process exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process launch error
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
	#[error("Unable to launch {name} (`{command_line}`)")]
	Spawn {
		name:         String,
		command_line: String,
		#[source]
		source:       io::Error,
	},
}

/// Process signalling error.
///
/// These are only ever logged, since teardown must proceed regardless.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
	#[error("Process already exited with {0}")]
	AlreadyExited(ExitStatus),

	#[error("Process was already terminated")]
	AlreadyTerminated,

	#[error("Unable to send {signal}")]
	Signal {
		signal: Signal,
		#[source]
		source: Errno,
	},

	#[error("Unable to check process status")]
	Wait(#[source] io::Error),
}

/// Supervised process
#[derive(Debug)]
pub struct Process {
	/// Name, for logs
	name: String,

	/// Child
	child: Child,

	/// Signal used to terminate it
	signal: Signal,

	/// Whether termination was already attempted
	terminated: bool,
}

impl Process {
	/// Returns the child
	pub fn child_mut(&mut self) -> &mut Child {
		&mut self.child
	}

	/// Terminates this process.
	///
	/// Signals the process group, then waits a bounded time for the process to exit.
	/// Only the first call signals anything.
	pub fn terminate(&mut self) -> Result<(), SignalError> {
		if self.terminated {
			return Err(SignalError::AlreadyTerminated);
		}
		self.terminated = true;

		if let Some(status) = self.child.try_wait().map_err(SignalError::Wait)? {
			return Err(SignalError::AlreadyExited(status));
		}

		// Note: We're the process group leader, so the group id is our pid
		let pgid = Pid::from_raw(self.child.id() as i32);
		tracing::info!(name = %self.name, %pgid, signal = %self.signal, "Terminating process");
		signal::killpg(pgid, self.signal).map_err(|source| SignalError::Signal {
			signal: self.signal,
			source,
		})?;

		let deadline = Instant::now() + TERMINATION_GRACE;
		loop {
			if let Some(status) = self.child.try_wait().map_err(SignalError::Wait)? {
				tracing::info!(name = %self.name, %status, "Process exited");
				return Ok(());
			}
			if Instant::now() >= deadline {
				tracing::warn!(name = %self.name, grace = ?TERMINATION_GRACE, "Process didn't exit after signal");
				return Ok(());
			}
			thread::sleep(EXIT_POLL_INTERVAL);
		}
	}
}

/// Process supervisor
#[derive(Debug, Default)]
pub struct Supervisor {
	/// All processes, in launch order
	processes: Vec<Process>,
}

impl Supervisor {
	/// Creates a supervisor with no processes
	pub fn new() -> Self {
		Self::default()
	}

	/// Launches `cmd` in a new process group.
	///
	/// The process is terminated with `signal` during teardown.
	pub fn spawn(&mut self, name: &str, cmd: &mut Command, signal: Signal) -> Result<&mut Process, ProcessError> {
		let command_line = cmd.command_line();
		tracing::info!(%name, %command_line, "Launching process");

		let child = cmd.process_group(0).spawn().map_err(|source| ProcessError::Spawn {
			name: name.to_owned(),
			command_line,
			source,
		})?;
		tracing::debug!(%name, pid = child.id(), "Launched process");

		self.processes.push(Process {
			name: name.to_owned(),
			child,
			signal,
			terminated: false,
		});
		Ok(self.processes.last_mut().expect("Just pushed a process"))
	}

	/// Returns the number of supervised processes
	pub fn len(&self) -> usize {
		self.processes.len()
	}

	/// Returns whether no processes are supervised
	pub fn is_empty(&self) -> bool {
		self.processes.is_empty()
	}

	/// Terminates all processes, most recently launched first.
	///
	/// Failures are logged and returned, but never stop the remaining terminations.
	pub fn terminate_all(&mut self) -> Vec<(String, Result<(), SignalError>)> {
		self.processes
			.iter_mut()
			.rev()
			.map(|process| {
				let res = process.terminate();
				match &res {
					Ok(()) => (),
					Err(SignalError::AlreadyTerminated) => {
						tracing::debug!(name = %process.name, "Process already terminated")
					},
					Err(err) => tracing::warn!(name = %process.name, ?err, "Unable to terminate process"),
				}
				(process.name.clone(), res)
			})
			.collect()
	}
}

impl Drop for Supervisor {
	fn drop(&mut self) {
		let _ = self.terminate_all();
	}
}

/// Builds the command that launches the monitor
pub fn monitor_command(config: &Config) -> Command {
	let monitor = &config.monitor;
	let mut cmd = Command::new(&monitor.script);
	cmd.arg(&monitor.path)
		.arg(&monitor.drive)
		.arg(&monitor.kernel)
		.arg(monitor.num_cores.to_string())
		.arg(&monitor.events)
		.arg(&monitor.trace)
		.arg(&monitor.memory_size);

	cmd
}

/// Builds the command that launches the simulator.
///
/// When distributed, the simulator is launched through the process-group
/// launcher, with a leading flag telling it whether tracing starts at the pause
/// point (`y`) or from boot (`n`).
pub fn simulator_command(config: &Config) -> Command {
	let simulator = &config.simulator;
	match simulator.distributed {
		true => {
			let mut cmd = Command::new(&simulator.launcher);
			cmd.arg("-v")
				.arg("-np")
				.arg(simulator.processes.to_string())
				.arg(&simulator.path)
				.arg(match config.tracing_from_start {
					true => "n",
					false => "y",
				})
				.arg(&config.monitor.trace)
				.arg(config.monitor.num_cores.to_string())
				.arg(&config.memory_dump_path)
				.arg(&config.memory_range_path)
				.arg(&config.register_values_path)
				.arg(&config.monitor.trace_mapping_out)
				.arg(&simulator.output);
			cmd
		},
		false => {
			let mut cmd = Command::new(&simulator.path);
			cmd.arg(&config.monitor.trace_mapping_out)
				.arg(&config.monitor.trace)
				.arg(&simulator.output)
				.arg(config.monitor.num_cores.to_string())
				.arg(&config.memory_dump_path)
				.arg(&config.memory_range_path)
				.arg(&config.register_values_path);
			cmd
		},
	}
}
