//! Virtual-machine tracing experiment controller (`vmtrace`)

// Modules
pub mod backend;
pub mod config;
pub mod console;
pub mod experiment;
pub mod memory_map;
pub mod qmp;
pub mod readiness;
pub mod registers;
pub mod supervisor;

// Exports
pub use self::{
	backend::LocalBackend,
	config::Config,
	experiment::{Backend, Controller, Report, State},
	qmp::{QmpClient, QmpError},
};
