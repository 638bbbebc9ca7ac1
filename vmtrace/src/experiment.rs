//! Experiment controller.
//!
//! Sequences a whole tracing run, from launching the monitor to collecting the
//! benchmark timing. Any failure aborts the run, after which every launched
//! process is torn down.

// Imports
use {
	crate::{
		config::Config,
		console::{LineSession, Pattern},
		memory_map::{self, MemoryRegion},
		qmp::QmpClient,
		readiness::ReadySignal,
		registers,
	},
	anyhow::Context,
	std::{
		fmt,
		fs,
		io,
		time::{Duration, Instant},
	},
	vmtrace_util::DisplayWrapper,
};

/// Experiment state
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize)]
pub enum State {
	Idle,
	MonitorStarting,
	ProtocolHandshaking,
	MemoryMapDiscovered,
	GuestAuthenticating,
	EnvironmentSourced,
	Paused,
	SnapshotsCaptured,
	InstrumentationArmed,
	SimulatorReady,
	Running,
	BenchmarkComplete,
	TearingDown,
	Terminated,
}

impl State {
	/// Returns the next state on a successful run
	pub fn next(self) -> Option<Self> {
		let next = match self {
			Self::Idle => Self::MonitorStarting,
			Self::MonitorStarting => Self::ProtocolHandshaking,
			Self::ProtocolHandshaking => Self::MemoryMapDiscovered,
			Self::MemoryMapDiscovered => Self::GuestAuthenticating,
			Self::GuestAuthenticating => Self::EnvironmentSourced,
			Self::EnvironmentSourced => Self::Paused,
			Self::Paused => Self::SnapshotsCaptured,
			Self::SnapshotsCaptured => Self::InstrumentationArmed,
			Self::InstrumentationArmed => Self::SimulatorReady,
			Self::SimulatorReady => Self::Running,
			Self::Running => Self::BenchmarkComplete,
			Self::BenchmarkComplete => Self::TearingDown,
			Self::TearingDown => Self::Terminated,
			Self::Terminated => return None,
		};

		Some(next)
	}
}

impl fmt::Display for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Collaborators of the experiment.
///
/// Launches and owns the external processes, and hands the controller the
/// channels it drives them through.
pub trait Backend {
	/// Control-protocol stream
	type Control: io::Read + io::Write;

	/// Guest console
	type Console: LineSession;

	/// Readiness signal
	type Signal: ReadySignal;

	/// Opens the readiness signal, before anything else is launched
	fn open_readiness(&mut self) -> Result<Self::Signal, anyhow::Error>;

	/// Launches the simulator, which waits on the readiness signal
	fn start_simulator(&mut self) -> Result<(), anyhow::Error>;

	/// Launches the monitor, returning its console
	fn start_monitor(&mut self) -> Result<Self::Console, anyhow::Error>;

	/// Connects to the monitor's control endpoint
	fn connect(&mut self) -> Result<QmpClient<Self::Control>, anyhow::Error>;

	/// Terminates everything launched so far.
	///
	/// Must not fail, and must be safe to call more than once.
	fn teardown(&mut self);
}

/// Run report
#[derive(Clone, Debug)]
#[derive(serde::Serialize)]
pub struct Report {
	/// Benchmark
	pub benchmark: String,

	/// Wall time spent on the benchmark (in seconds)
	pub benchmark_secs: f64,

	/// Guest memory regions
	pub regions: Vec<MemoryRegion>,

	/// Number of cpus whose registers were captured
	pub cpus: usize,

	/// State the controller finished in
	pub state: State,
}

/// Experiment controller
#[derive(Debug)]
pub struct Controller<'a> {
	/// Config
	config: &'a Config,

	/// Current state
	state: State,

	/// All states visited, in order
	history: Vec<State>,
}

impl<'a> Controller<'a> {
	/// Creates a new controller
	pub fn new(config: &'a Config) -> Self {
		Self {
			config,
			state: State::Idle,
			history: vec![State::Idle],
		}
	}

	/// Returns the current state
	pub fn state(&self) -> State {
		self.state
	}

	/// Returns all states visited so far
	pub fn history(&self) -> &[State] {
		&self.history
	}

	/// Runs the experiment.
	///
	/// The backend is always torn down before returning, whether the run
	/// succeeded or not.
	pub fn run<B: Backend>(&mut self, backend: &mut B) -> Result<Report, anyhow::Error> {
		let res = self.run_sequence(backend);
		let res = match res {
			Ok(report) => Ok(report),
			Err(err) => {
				let failed_state = self.state;
				tracing::error!(state = %failed_state, "Experiment failed: {err:?}");
				Err(err.context(format!("Experiment failed after reaching state {failed_state}")))
			},
		};

		self.transition(State::TearingDown);
		backend.teardown();
		self.transition(State::Terminated);

		res.map(|report| Report {
			state: self.state,
			..report
		})
	}

	/// Runs every step of the experiment, up to the end of the benchmark
	fn run_sequence<B: Backend>(&mut self, backend: &mut B) -> Result<Report, anyhow::Error> {
		let config = self.config;

		// Launch everything.
		// Note: The simulator goes first, since the monitor blocks until the
		//       trace destination has a reader.
		let mut readiness = backend.open_readiness().context("Unable to open readiness signal")?;
		match config.simulator.run {
			true => backend.start_simulator().context("Unable to start simulator")?,
			false => tracing::info!("Not launching simulator"),
		}
		let mut console = backend.start_monitor().context("Unable to start monitor")?;
		self.transition(State::MonitorStarting);

		let mut qmp = backend.connect().context("Unable to connect to monitor")?;
		qmp.handshake().context("Unable to negotiate capabilities")?;
		self.transition(State::ProtocolHandshaking);

		let regions = qmp.query_memory_map().context("Unable to query memory map")?;
		tracing::info!(
			"Memory map: {}",
			DisplayWrapper::new(|f| regions.iter().try_for_each(|region| write!(f, "[{region}] ")))
		);
		memory_map::write_file(&config.memory_range_path, &regions)
			.with_context(|| format!("Unable to write memory map to {:?}", config.memory_range_path))?;
		self.transition(State::MemoryMapDiscovered);

		self.transition(State::GuestAuthenticating);
		self.login(&mut console).context("Unable to log into guest")?;
		self.setup_environment(&mut console)
			.context("Unable to set up guest environment")?;
		self.transition(State::EnvironmentSourced);

		qmp.pause().context("Unable to pause monitor")?;
		self.log_events(&mut qmp);
		self.transition(State::Paused);

		let cpus = self.capture_snapshots(&mut qmp, &regions)?;
		self.transition(State::SnapshotsCaptured);

		for event in &config.monitor.trace_events {
			qmp.set_trace_event(event, true)
				.with_context(|| format!("Unable to enable trace event {event:?}"))?;
		}
		self.transition(State::InstrumentationArmed);

		readiness.post().context("Unable to signal simulator")?;
		self.transition(State::SimulatorReady);

		qmp.resume().context("Unable to resume monitor")?;
		self.log_events(&mut qmp);
		self.transition(State::Running);

		let elapsed = self.run_benchmark(&mut console).context("Unable to run benchmark")?;
		tracing::info!(?elapsed, "Time spent on benchmark");
		self.transition(State::BenchmarkComplete);

		Ok(Report {
			benchmark: config.benchmark.clone(),
			benchmark_secs: elapsed.as_secs_f64(),
			regions,
			cpus,
			state: self.state,
		})
	}

	/// Logs into the guest, up to the first shell prompt
	fn login(&self, console: &mut impl LineSession) -> Result<(), anyhow::Error> {
		let guest = &self.config.guest;
		let shell_prompt = Pattern::from(guest.shell_prompt.as_str());

		tracing::info!("Waiting for login");
		console
			.expect(&guest.login_prompt.as_str().into(), guest.boot_timeout())
			.context("Login prompt never appeared")?;
		console
			.run(&guest.username, &guest.password_prompt.as_str().into(), guest.prompt_timeout())
			.context("Password prompt never appeared")?;
		console
			.run(&guest.password, &shell_prompt, guest.prompt_timeout())
			.context("Shell prompt never appeared after login")?;
		tracing::info!("Successfully logged in");

		Ok(())
	}

	/// Runs every setup command, waiting for the shell prompt after each
	fn setup_environment(&self, console: &mut impl LineSession) -> Result<(), anyhow::Error> {
		let guest = &self.config.guest;
		let shell_prompt = Pattern::from(guest.shell_prompt.as_str());
		for cmd in &guest.setup_commands {
			console
				.run(cmd, &shell_prompt, guest.prompt_timeout())
				.with_context(|| format!("Setup command {cmd:?} didn't finish"))?;
		}

		Ok(())
	}

	/// Captures the register snapshot and a memory snapshot of every region.
	///
	/// Returns the number of cpus captured.
	fn capture_snapshots<S: io::Read + io::Write>(
		&self,
		qmp: &mut QmpClient<S>,
		regions: &[MemoryRegion],
	) -> Result<usize, anyhow::Error> {
		let config = self.config;

		let dump = qmp.query_registers().context("Unable to query registers")?;
		let cpus = registers::parse(&dump).context("Unable to parse registers")?;
		registers::write_file(&config.register_values_path, &cpus)
			.with_context(|| format!("Unable to write register values to {:?}", config.register_values_path))?;
		tracing::info!(cpus = cpus.len(), "Captured control registers");

		// Note: The monitor resolves relative paths against its own working directory
		fs::create_dir_all(&config.memory_dump_path).context("Unable to create memory dump directory")?;
		let dump_dir = fs::canonicalize(&config.memory_dump_path).context("Unable to resolve memory dump directory")?;
		for region in regions {
			let path = region.dump_path(&dump_dir);
			tracing::debug!(%region, ?path, "Saving memory region");
			qmp.save_memory_range(region, &path)
				.with_context(|| format!("Unable to save memory region {region}"))?;
		}
		tracing::info!(regions = regions.len(), ?dump_dir, "Captured memory");

		Ok(cpus.len())
	}

	/// Runs the benchmark, returning the time it took
	fn run_benchmark(&self, console: &mut impl LineSession) -> Result<Duration, anyhow::Error> {
		let guest = &self.config.guest;
		let cmd = self::benchmark_command(self.config);

		let start = Instant::now();
		console
			.run(&cmd, &guest.shell_prompt.as_str().into(), guest.benchmark_timeout())
			.with_context(|| format!("Benchmark {cmd:?} didn't finish"))?;

		Ok(start.elapsed())
	}

	/// Logs all events received so far
	fn log_events<S: io::Read + io::Write>(&self, qmp: &mut QmpClient<S>) {
		for event in qmp.take_events() {
			tracing::debug!(name = %event.name, data = ?event.data, "Monitor event");
		}
	}

	/// Moves to `state`.
	///
	/// Teardown may start from any state, everything else must follow the
	/// successful run order.
	fn transition(&mut self, state: State) {
		debug_assert!(
			state == State::TearingDown || self.state.next() == Some(state),
			"Invalid transition {} -> {state}",
			self.state
		);

		tracing::info!(from = %self.state, to = %state, "Transition");
		self.state = state;
		self.history.push(state);
	}
}

/// Returns the guest command that runs the benchmark
pub fn benchmark_command(config: &Config) -> String {
	match &config.guest.benchmark_command {
		Some(cmd) => cmd.clone(),
		None => format!(
			"parsecmgmt -a run -p {} -i {} -n {} -s \"echo 'Starting' && time\"",
			config.benchmark, config.benchmark_size, config.monitor.num_cores
		),
	}
}
