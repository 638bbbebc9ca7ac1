//! Virtual-machine tracing experiment controller (`vmtrace`)

// Modules
mod args;

// Imports
use {
	self::args::Args,
	anyhow::Context,
	clap::Parser,
	std::fs,
	vmtrace::{Config, Controller, LocalBackend},
	vmtrace_util::logger,
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));
	if args.log_file_append && args.log_file.is_none() {
		logger::pre_init::warn("`--log-file-append` has no effect without `--log-file`");
	}

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Read the config file
	let config = Config::from_path(&args.config_file)
		.with_context(|| format!("Unable to load config {:?}", args.config_file))?;
	tracing::debug!(?config, "Loaded config");

	// Run the experiment
	let mut backend = LocalBackend::new(&config);
	let mut controller = Controller::new(&config);
	let report = controller.run(&mut backend).context("Unable to run experiment")?;
	tracing::info!(
		benchmark = %report.benchmark,
		benchmark_secs = report.benchmark_secs,
		regions = report.regions.len(),
		cpus = report.cpus,
		"Experiment finished"
	);

	if let Some(output_path) = &args.output_file {
		let output_file = fs::File::create(output_path).context("Unable to create output file")?;
		serde_json::to_writer_pretty(output_file, &report).context("Unable to write to output file")?;
	}

	Ok(())
}
