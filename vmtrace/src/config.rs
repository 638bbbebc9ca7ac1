//! Configuration

// Imports
use {
	anyhow::Context,
	std::{
		fs,
		path::{Path, PathBuf},
		time::Duration,
	},
};

/// Configuration
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Config {
	/// Benchmark to run
	pub benchmark: String,

	/// Benchmark input size
	pub benchmark_size: String,

	/// Whether tracing starts from boot, instead of from the pause point
	#[serde(default)]
	pub tracing_from_start: bool,

	/// Directory the per-region memory dumps are saved to
	pub memory_dump_path: PathBuf,

	/// File the memory map is written to
	pub memory_range_path: PathBuf,

	/// File the control register values are written to
	pub register_values_path: PathBuf,

	/// Monitor
	pub monitor: MonitorConfig,

	/// Simulator
	pub simulator: SimulatorConfig,

	/// Guest
	#[serde(default)]
	pub guest: GuestConfig,

	/// Readiness signal
	#[serde(default)]
	pub readiness: ReadinessConfig,
}

impl Config {
	/// Loads a config from the json file at `path`
	pub fn from_path(path: &Path) -> Result<Self, anyhow::Error> {
		let config_file = fs::File::open(path).context("Unable to open config file")?;
		let config = serde_json::from_reader::<_, Self>(config_file).context("Unable to parse config file")?;
		config.validate().context("Invalid config")?;

		Ok(config)
	}

	/// Validates this config
	pub fn validate(&self) -> Result<(), anyhow::Error> {
		anyhow::ensure!(!self.benchmark.is_empty(), "Benchmark not defined");
		anyhow::ensure!(self.monitor.num_cores > 0, "Monitor must have at least 1 core");
		anyhow::ensure!(
			!self.simulator.distributed || self.simulator.processes > 0,
			"Distributed simulator must have at least 1 process"
		);
		anyhow::ensure!(
			self.readiness.name.starts_with('/') && !self.readiness.name[1..].contains('/'),
			"Readiness signal name must be of the form `/name`, found {:?}",
			self.readiness.name
		);

		Ok(())
	}
}

/// Monitor config
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MonitorConfig {
	/// Launcher script
	#[serde(default = "default::monitor_script")]
	pub script: PathBuf,

	/// Monitor binary
	pub path: PathBuf,

	/// Disk image
	pub drive: PathBuf,

	/// Guest kernel
	pub kernel: PathBuf,

	/// Number of guest cores
	pub num_cores: usize,

	/// Trace events file, enabled from boot
	pub events: PathBuf,

	/// Trace destination
	#[serde(default = "default::trace")]
	pub trace: PathBuf,

	/// Guest memory size
	#[serde(default = "default::memory_size")]
	pub memory_size: String,

	/// Trace event mapping, produced by the monitor and read by the simulator
	pub trace_mapping_out: PathBuf,

	/// Control endpoint
	#[serde(default = "default::control_socket")]
	pub control_socket: PathBuf,

	/// Trace events enabled when arming instrumentation
	#[serde(default)]
	pub trace_events: Vec<String>,

	/// Time to wait for the control endpoint to come up (in seconds)
	#[serde(default = "default::connect_timeout_secs")]
	pub connect_timeout_secs: f64,

	/// Time to wait for each control reply (in seconds)
	#[serde(default = "default::reply_timeout_secs")]
	pub reply_timeout_secs: f64,
}

impl MonitorConfig {
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.connect_timeout_secs)
	}

	pub fn reply_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.reply_timeout_secs)
	}
}

/// Simulator config
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SimulatorConfig {
	/// Whether to launch the simulator
	#[serde(default = "default::yes")]
	pub run: bool,

	/// Simulator binary
	#[serde(default = "default::simulator_path")]
	pub path: PathBuf,

	/// Whether to launch the simulator distributed
	#[serde(default)]
	pub distributed: bool,

	/// Number of processes, when distributed
	#[serde(default = "default::processes")]
	pub processes: usize,

	/// Simulator output
	pub output: PathBuf,

	/// Process-group launcher, when distributed
	#[serde(default = "default::launcher")]
	pub launcher: PathBuf,
}

/// Guest config
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GuestConfig {
	pub username:        String,
	pub password:        String,
	pub login_prompt:    String,
	pub password_prompt: String,
	pub shell_prompt:    String,

	/// Commands run after logging in, each waited on until the shell prompt
	pub setup_commands: Vec<String>,

	/// Benchmark invocation, replacing the default `parsecmgmt` one
	pub benchmark_command: Option<String>,

	/// Time to wait for the login prompt after launching (in seconds)
	pub boot_timeout_secs: f64,

	/// Time to wait for every other prompt (in seconds)
	pub prompt_timeout_secs: f64,

	/// Time to wait for the benchmark to finish (in seconds)
	pub benchmark_timeout_secs: f64,
}

impl GuestConfig {
	pub fn boot_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.boot_timeout_secs)
	}

	pub fn prompt_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.prompt_timeout_secs)
	}

	pub fn benchmark_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.benchmark_timeout_secs)
	}
}

impl Default for GuestConfig {
	fn default() -> Self {
		Self {
			username:               "root".to_owned(),
			password:               String::new(),
			login_prompt:           "localhost login:".to_owned(),
			password_prompt:        "Password:".to_owned(),
			shell_prompt:           "# ".to_owned(),
			setup_commands:         vec!["cd parsec-3.0/".to_owned(), "source env.sh".to_owned()],
			benchmark_command:      None,
			boot_timeout_secs:      300.0,
			prompt_timeout_secs:    30.0,
			benchmark_timeout_secs: 24.0 * 60.0 * 60.0,
		}
	}
}

/// Readiness signal config
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
	/// Semaphore name
	pub name: String,

	/// Semaphore permissions
	pub mode: u32,
}

impl Default for ReadinessConfig {
	fn default() -> Self {
		Self {
			name: "/vmtrace-ready".to_owned(),
			mode: 0o644,
		}
	}
}

/// Defaults
mod default {
	// Imports
	use std::path::PathBuf;

	pub fn yes() -> bool {
		true
	}

	pub fn monitor_script() -> PathBuf {
		PathBuf::from("./runqemu.sh")
	}

	pub fn trace() -> PathBuf {
		PathBuf::from("trace")
	}

	pub fn memory_size() -> String {
		"8G".to_owned()
	}

	pub fn control_socket() -> PathBuf {
		PathBuf::from("/tmp/qemu-monitor")
	}

	pub fn connect_timeout_secs() -> f64 {
		30.0
	}

	pub fn reply_timeout_secs() -> f64 {
		60.0
	}

	pub fn simulator_path() -> PathBuf {
		PathBuf::from("cache-simulator")
	}

	pub fn processes() -> usize {
		2
	}

	pub fn launcher() -> PathBuf {
		PathBuf::from("mpirun")
	}
}
