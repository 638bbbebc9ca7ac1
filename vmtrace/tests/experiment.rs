//! Whole-experiment scenarios, against a scripted monitor and guest

// Imports
use {
	serde_json::{json, Value},
	std::{
		fs,
		io::{BufRead, BufReader, Write},
		os::unix::net::UnixStream,
		path::Path,
		sync::{Arc, Mutex},
		thread,
		time::Duration,
	},
	vmtrace::{
		console::{LineSession, Pattern, SessionError},
		experiment::benchmark_command,
		readiness::{ReadinessError, ReadySignal},
		Backend,
		Config,
		Controller,
		QmpClient,
		QmpError,
		State,
	},
};

/// Register dump the scripted monitor reports for a 2 cpu guest
const REGISTER_DUMP: &str = "CPU#0\nRAX=0000000000000000 RBX=0000000000000000\nCR0=80050033 CR2=00007f2a4c001000 \
                             CR3=0000000102a3e000 CR4=003506f0\nCPU#1\nRAX=0000000000000001\nCR0=80050033 \
                             CR2=0000000000000000 CR3=0000000102a3e000 CR4=003506f0\n";

/// Ordered record of everything the controller did to its collaborators
type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Journal, entry: impl Into<String>) {
	journal.lock().expect("Journal poisoned").push(entry.into());
}

/// Scripted guest console.
///
/// Every pattern matches immediately, except when the pattern or the last line
/// sent contains `stall_on`, which times out.
struct ScriptedConsole {
	journal:   Journal,
	stall_on:  Option<&'static str>,
	last_sent: String,
}

impl LineSession for ScriptedConsole {
	fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
		self::record(&self.journal, format!("send {line}"));
		self.last_sent = line.to_owned();
		Ok(())
	}

	fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String, SessionError> {
		let pattern = pattern.to_string();
		if self
			.stall_on
			.is_some_and(|stall_on| pattern.contains(stall_on) || self.last_sent.contains(stall_on))
		{
			return Err(SessionError::Timeout { pattern, timeout });
		}

		self::record(&self.journal, format!("expect {pattern}"));
		Ok(pattern)
	}
}

/// Readiness signal that only records posts
struct RecordingSignal {
	journal: Journal,
}

impl ReadySignal for RecordingSignal {
	fn post(&mut self) -> Result<(), ReadinessError> {
		self::record(&self.journal, "post");
		Ok(())
	}
}

/// Scripted monitor behavior
#[derive(Clone, Copy, Default)]
struct MonitorScript {
	/// Command that fails with a protocol error
	fail_command: Option<&'static str>,
}

/// Spawns a monitor on `stream`, recording every command it receives
fn spawn_monitor(stream: UnixStream, journal: Journal, script: MonitorScript) -> thread::JoinHandle<()> {
	thread::spawn(move || {
		let mut writer = stream.try_clone().expect("Unable to clone stream");
		writeln!(writer, "{}", json!({ "QMP": { "version": {}, "capabilities": [] } })).expect("Unable to greet");

		for line in BufReader::new(stream).lines() {
			let Ok(line) = line else { break };
			let cmd = serde_json::from_str::<Value>(&line).expect("Controller sent invalid json");
			let execute = cmd["execute"].as_str().expect("Command without `execute`").to_owned();
			match execute.as_str() {
				"pmemsave" => self::record(&journal, format!("pmemsave {}", cmd["arguments"])),
				"trace-event-set-state" => self::record(&journal, format!("trace {}", cmd["arguments"]["name"])),
				_ => self::record(&journal, execute.clone()),
			}

			let id = cmd["id"].clone();
			let reply = match execute.as_str() {
				_ if script.fail_command == Some(execute.as_str()) => json!({
					"error": { "class": "GenericError", "desc": "scripted failure" },
					"id": id,
				}),
				"e820-info" => json!({
					"return": [{ "start": 0, "end": 655360 }, { "start": 1048576, "end": 134217728 }],
					"id": id,
				}),
				"human-monitor-command" => json!({ "return": REGISTER_DUMP, "id": id }),
				"stop" => {
					let event = json!({ "event": "STOP", "timestamp": { "seconds": 1, "microseconds": 0 } });
					writeln!(writer, "{event}").expect("Unable to send event");
					json!({ "return": {}, "id": id })
				},
				_ => json!({ "return": {}, "id": id }),
			};
			writeln!(writer, "{reply}").expect("Unable to reply");
		}
	})
}

/// Scripted backend
struct ScriptedBackend {
	journal:  Journal,
	monitor:  MonitorScript,
	stall_on: Option<&'static str>,
	threads:  Vec<thread::JoinHandle<()>>,
}

impl ScriptedBackend {
	fn new(monitor: MonitorScript, stall_on: Option<&'static str>) -> Self {
		Self {
			journal: Arc::default(),
			monitor,
			stall_on,
			threads: vec![],
		}
	}

	fn journal(&self) -> Vec<String> {
		self.journal.lock().expect("Journal poisoned").clone()
	}

	fn count(&self, entry: &str) -> usize {
		self.journal().iter().filter(|recorded| *recorded == entry).count()
	}
}

impl Backend for ScriptedBackend {
	type Console = ScriptedConsole;
	type Control = UnixStream;
	type Signal = RecordingSignal;

	fn open_readiness(&mut self) -> Result<Self::Signal, anyhow::Error> {
		self::record(&self.journal, "open readiness");
		Ok(RecordingSignal {
			journal: Arc::clone(&self.journal),
		})
	}

	fn start_simulator(&mut self) -> Result<(), anyhow::Error> {
		self::record(&self.journal, "start simulator");
		Ok(())
	}

	fn start_monitor(&mut self) -> Result<Self::Console, anyhow::Error> {
		self::record(&self.journal, "start monitor");
		Ok(ScriptedConsole {
			journal:   Arc::clone(&self.journal),
			stall_on:  self.stall_on,
			last_sent: String::new(),
		})
	}

	fn connect(&mut self) -> Result<QmpClient<Self::Control>, anyhow::Error> {
		let (client, server) = UnixStream::pair()?;
		client.set_read_timeout(Some(Duration::from_secs(5)))?;
		self.threads.push(self::spawn_monitor(
			server,
			Arc::clone(&self.journal),
			self.monitor,
		));

		Ok(QmpClient::new(client))
	}

	fn teardown(&mut self) {
		self::record(&self.journal, "teardown");

		// Note: The client is always dropped before teardown, so the monitors are done
		for thread in self.threads.drain(..) {
			thread.join().expect("Monitor panicked");
		}
	}
}

/// Returns a config writing all outputs inside of `dir`
fn config(dir: &Path) -> Config {
	let config = json!({
		"benchmark": "canneal",
		"benchmark_size": "simsmall",
		"memory_dump_path": dir.join("dumps"),
		"memory_range_path": dir.join("memory-ranges"),
		"register_values_path": dir.join("cr-values"),
		"monitor": {
			"path": "qemu-system-x86_64",
			"drive": "disk.qcow2",
			"kernel": "bzImage",
			"num_cores": 2,
			"events": "events",
			"trace_mapping_out": dir.join("trace_mapping"),
			"trace_events": ["guest_mem_access", "guest_tlb_flush"],
		},
		"simulator": {
			"output": dir.join("out"),
		},
	});

	let config = serde_json::from_value::<Config>(config).expect("Unable to parse config");
	config.validate().expect("Config should be valid");
	config
}

#[test]
fn full_run_reaches_terminated() {
	let dir = tempfile::tempdir().expect("Unable to create temporary directory");
	let config = self::config(dir.path());

	let mut backend = ScriptedBackend::new(MonitorScript::default(), None);
	let mut controller = Controller::new(&config);
	let report = controller.run(&mut backend).expect("Experiment failed");

	assert_eq!(controller.state(), State::Terminated);
	assert_eq!(controller.history(), [
		State::Idle,
		State::MonitorStarting,
		State::ProtocolHandshaking,
		State::MemoryMapDiscovered,
		State::GuestAuthenticating,
		State::EnvironmentSourced,
		State::Paused,
		State::SnapshotsCaptured,
		State::InstrumentationArmed,
		State::SimulatorReady,
		State::Running,
		State::BenchmarkComplete,
		State::TearingDown,
		State::Terminated,
	]);
	assert_eq!(report.state, State::Terminated);
	assert_eq!(report.regions.len(), 2);
	assert_eq!(report.cpus, 2);

	// Outputs
	let memory_ranges = fs::read_to_string(dir.path().join("memory-ranges")).expect("Unable to read memory map");
	assert_eq!(memory_ranges, "2\n0-a0000\n100000-8000000\n");
	let cr_values = fs::read_to_string(dir.path().join("cr-values")).expect("Unable to read register values");
	assert_eq!(
		cr_values,
		"0\n80050033\n0\n7f2a4c001000\n102a3e000\n3506f0\n1\n80050033\n0\n0\n102a3e000\n3506f0\n"
	);

	// Everything happened in order, and exactly once
	let dump_dir = fs::canonicalize(dir.path().join("dumps")).expect("Dump directory wasn't created");
	let pmemsave = |start: u64, end: u64| {
		let filename = dump_dir.join(format!("{start:x}-{end:x}"));
		format!(
			"pmemsave {}",
			json!({ "val": start, "size": end - start, "filename": filename.to_string_lossy() })
		)
	};
	let expected = [
		"open readiness".to_owned(),
		"start simulator".to_owned(),
		"start monitor".to_owned(),
		"qmp_capabilities".to_owned(),
		"e820-info".to_owned(),
		"expect \"localhost login:\"".to_owned(),
		"send root".to_owned(),
		"expect \"Password:\"".to_owned(),
		"send ".to_owned(),
		"expect \"# \"".to_owned(),
		"send cd parsec-3.0/".to_owned(),
		"expect \"# \"".to_owned(),
		"send source env.sh".to_owned(),
		"expect \"# \"".to_owned(),
		"stop".to_owned(),
		"human-monitor-command".to_owned(),
		pmemsave(0, 0xa0000),
		pmemsave(0x100000, 0x8000000),
		"trace \"guest_mem_access\"".to_owned(),
		"trace \"guest_tlb_flush\"".to_owned(),
		"post".to_owned(),
		"cont".to_owned(),
		format!("send {}", benchmark_command(&config)),
		"expect \"# \"".to_owned(),
		"teardown".to_owned(),
	];
	assert_eq!(backend.journal(), expected);
}

#[test]
fn simulator_can_be_skipped() {
	let dir = tempfile::tempdir().expect("Unable to create temporary directory");
	let mut config = self::config(dir.path());
	config.simulator.run = false;

	let mut backend = ScriptedBackend::new(MonitorScript::default(), None);
	Controller::new(&config).run(&mut backend).expect("Experiment failed");

	assert_eq!(backend.count("start simulator"), 0);
	assert_eq!(backend.count("post"), 1);
	assert_eq!(backend.count("teardown"), 1);
}

#[test]
fn login_timeout_tears_down() {
	let dir = tempfile::tempdir().expect("Unable to create temporary directory");
	let config = self::config(dir.path());

	let mut backend = ScriptedBackend::new(MonitorScript::default(), Some("login:"));
	let mut controller = Controller::new(&config);
	let err = controller.run(&mut backend).expect_err("Experiment should fail");

	let session_err = err
		.downcast_ref::<SessionError>()
		.expect("Failure should be a session error");
	assert!(matches!(session_err, SessionError::Timeout { .. }));
	assert!(format!("{err:#}").contains("GuestAuthenticating"));

	assert_eq!(controller.state(), State::Terminated);
	assert_eq!(backend.count("teardown"), 1);
	assert_eq!(backend.count("stop"), 0);
	assert_eq!(backend.count("post"), 0);
}

#[test]
fn protocol_error_aborts_before_readiness() {
	let dir = tempfile::tempdir().expect("Unable to create temporary directory");
	let config = self::config(dir.path());

	let script = MonitorScript {
		fail_command: Some("trace-event-set-state"),
	};
	let mut backend = ScriptedBackend::new(script, None);
	let mut controller = Controller::new(&config);
	let err = controller.run(&mut backend).expect_err("Experiment should fail");

	let qmp_err = err.downcast_ref::<QmpError>().expect("Failure should be a protocol error");
	assert!(matches!(qmp_err, QmpError::Protocol { class, .. } if class == "GenericError"));
	assert!(format!("{err:#}").contains("SnapshotsCaptured"));

	assert_eq!(controller.state(), State::Terminated);
	assert_eq!(backend.count("post"), 0);
	assert_eq!(backend.count("cont"), 0);
	assert_eq!(backend.count("teardown"), 1);
}

#[test]
fn benchmark_timeout_tears_down() {
	let dir = tempfile::tempdir().expect("Unable to create temporary directory");
	let mut config = self::config(dir.path());
	config.guest.benchmark_command = Some("./bench".to_owned());

	let mut backend = ScriptedBackend::new(MonitorScript::default(), Some("./bench"));
	let mut controller = Controller::new(&config);
	let err = controller.run(&mut backend).expect_err("Experiment should fail");
	assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::Timeout { .. })));
	assert!(format!("{err:#}").contains("Running"));

	// The guest was resumed and the simulator released before the benchmark stalled
	assert_eq!(backend.count("send ./bench"), 1);
	assert_eq!(backend.count("cont"), 1);
	assert_eq!(backend.count("post"), 1);
	assert_eq!(backend.count("teardown"), 1);
}
