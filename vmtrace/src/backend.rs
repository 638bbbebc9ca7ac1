//! Local process backend

// Imports
use {
	crate::{
		config::Config,
		console::ConsoleSession,
		experiment::Backend,
		qmp::QmpClient,
		readiness::NamedSemaphore,
		supervisor::{self, SignalError, Supervisor},
	},
	anyhow::Context,
	nix::sys::signal::Signal,
	std::{
		os::unix::net::UnixStream,
		process::{ChildStdin, ChildStdout, Stdio},
	},
};

/// Backend that launches the monitor and simulator as local processes
#[derive(Debug)]
pub struct LocalBackend<'a> {
	/// Config
	config: &'a Config,

	/// Launched processes
	supervisor: Supervisor,
}

impl<'a> LocalBackend<'a> {
	/// Creates a new backend, with nothing launched yet
	pub fn new(config: &'a Config) -> Self {
		Self {
			config,
			supervisor: Supervisor::new(),
		}
	}
}

impl Backend for LocalBackend<'_> {
	type Console = ConsoleSession<ChildStdout, ChildStdin>;
	type Control = UnixStream;
	type Signal = NamedSemaphore;

	fn open_readiness(&mut self) -> Result<Self::Signal, anyhow::Error> {
		let readiness = &self.config.readiness;
		let sem = NamedSemaphore::open(&readiness.name, readiness.mode, 0)?;

		// Note: Posts left over from an aborted run would release the simulator early
		let stale = sem.drain()?;
		if stale > 0 {
			tracing::warn!(name = %readiness.name, stale, "Drained stale readiness posts");
		}

		Ok(sem)
	}

	fn start_simulator(&mut self) -> Result<(), anyhow::Error> {
		let mut cmd = supervisor::simulator_command(self.config);
		cmd.stdin(Stdio::null());
		self.supervisor.spawn("simulator", &mut cmd, Signal::SIGINT)?;

		Ok(())
	}

	fn start_monitor(&mut self) -> Result<Self::Console, anyhow::Error> {
		let mut cmd = supervisor::monitor_command(self.config);
		cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
		let process = self.supervisor.spawn("monitor", &mut cmd, Signal::SIGTERM)?;

		let child = process.child_mut();
		let stdin = child.stdin.take().context("Monitor stdin wasn't piped")?;
		let stdout = child.stdout.take().context("Monitor stdout wasn't piped")?;

		Ok(ConsoleSession::new(stdout, stdin))
	}

	fn connect(&mut self) -> Result<QmpClient<Self::Control>, anyhow::Error> {
		let monitor = &self.config.monitor;
		let client = QmpClient::connect(&monitor.control_socket, monitor.connect_timeout(), monitor.reply_timeout())?;

		Ok(client)
	}

	fn teardown(&mut self) {
		if self.supervisor.is_empty() {
			tracing::debug!("No processes to tear down");
			return;
		}

		tracing::info!(processes = self.supervisor.len(), "Tearing down processes");
		let failed = self
			.supervisor
			.terminate_all()
			.into_iter()
			.filter(|(_, res)| matches!(res, Err(SignalError::Signal { .. } | SignalError::Wait(_))))
			.count();
		tracing::info!(failed, "Tore down all processes");
	}
}
