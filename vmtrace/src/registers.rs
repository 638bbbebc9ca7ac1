//! Control register snapshots

// Imports
use {
	anyhow::Context,
	regex::Regex,
	std::{
		fs,
		io::{self, Write},
		path::Path,
		sync::OnceLock,
	},
};

/// Number of control register values written per cpu
pub const CONTROL_REGISTERS: usize = 5;

/// Control register whose value is always written as `0`.
///
/// `CR1` is reserved on x86 and the monitor doesn't report it, but the
/// consumer of the snapshot file expects a slot for it.
pub const FIXED_REGISTER: usize = 1;

/// Register parsing error
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
	#[error("No cpus found in register dump")]
	NoCpus,

	#[error("Cpu #{cpu} is missing `CR{register}` (found {found} of {expected} reported registers)")]
	Missing {
		cpu:      u32,
		register: usize,
		found:    usize,
		expected: usize,
	},

	#[error("Unable to parse `CR{register}` value {value:?} of cpu #{cpu}")]
	Value { cpu: u32, register: usize, value: String },
}

/// Control registers of a single cpu
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize)]
pub struct CpuRegisters {
	/// Cpu index
	pub cpu: u32,

	/// `CR0` through `CR4`.
	///
	/// [`FIXED_REGISTER`] is always `0`.
	pub control: [u64; CONTROL_REGISTERS],
}

/// Parses the control registers of every cpu out of a human monitor register dump.
///
/// Each cpu's block starts with `CPU#<idx>`, and must report every control
/// register other than [`FIXED_REGISTER`] as `CR<n>=<hex>`.
pub fn parse(dump: &str) -> Result<Vec<CpuRegisters>, RegisterError> {
	static CPU_REGEX: OnceLock<Regex> = OnceLock::new();
	static CR_REGEX: OnceLock<Regex> = OnceLock::new();
	let cpu_regex = CPU_REGEX.get_or_init(|| Regex::new(r"CPU#(\d{1,9})").expect("Cpu regex is valid"));
	let cr_regex = CR_REGEX.get_or_init(|| Regex::new(r"\bCR(\d)=([0-9a-fA-F]+)").expect("Control register regex is valid"));

	// Split the dump into per-cpu blocks
	let headers = cpu_regex.captures_iter(dump).collect::<Vec<_>>();
	if headers.is_empty() {
		return Err(RegisterError::NoCpus);
	}

	let expected = CONTROL_REGISTERS - 1;
	let mut cpus = Vec::with_capacity(headers.len());
	for (idx, header) in headers.iter().enumerate() {
		let header_match = header.get(0).expect("Capture group 0 always exists");
		let block_end = headers
			.get(idx + 1)
			.and_then(|next| next.get(0))
			.map_or(dump.len(), |next| next.start());
		let block = &dump[header_match.end()..block_end];

		// Note: The header matches at most 9 digits, so this can't overflow
		let cpu = header[1].parse::<u32>().expect("Cpu index fits in `u32`");

		let mut control = [None; CONTROL_REGISTERS];
		for cr in cr_regex.captures_iter(block) {
			let register = cr[1].parse::<usize>().expect("Register index is a single digit");
			if register >= CONTROL_REGISTERS || register == FIXED_REGISTER {
				continue;
			}

			let value = u64::from_str_radix(&cr[2], 16).map_err(|_| RegisterError::Value {
				cpu,
				register,
				value: cr[2].to_owned(),
			})?;
			control[register] = Some(value);
		}
		control[FIXED_REGISTER] = Some(0);

		let found = control.iter().flatten().count() - 1;
		let mut values = [0; CONTROL_REGISTERS];
		for (register, (value, slot)) in control.into_iter().zip(&mut values).enumerate() {
			*slot = value.ok_or(RegisterError::Missing {
				cpu,
				register,
				found,
				expected,
			})?;
		}

		cpus.push(CpuRegisters { cpu, control: values });
	}

	Ok(cpus)
}

/// Writes the register snapshot to `writer`.
///
/// Each cpu produces one line with its index, followed by one line per
/// control register, in hex.
pub fn write<W: io::Write>(writer: &mut W, cpus: &[CpuRegisters]) -> Result<(), io::Error> {
	for cpu in cpus {
		writeln!(writer, "{}", cpu.cpu)?;
		for (register, value) in cpu.control.iter().enumerate() {
			match register == FIXED_REGISTER {
				true => writeln!(writer, "0")?,
				false => writeln!(writer, "{value:x}")?,
			}
		}
	}

	Ok(())
}

/// Writes the register snapshot to the file at `path`.
///
/// The file may already exist (e.g. as a fifo the simulator reads from).
pub fn write_file(path: &Path, cpus: &[CpuRegisters]) -> Result<(), anyhow::Error> {
	let file = fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.open(path)
		.context("Unable to open register values file")?;
	let mut file = io::BufWriter::new(file);
	self::write(&mut file, cpus).context("Unable to write register values")?;
	file.flush().context("Unable to flush register values file")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Builds a synthetic dump with `cpus` cpus, reporting `CR0` through `CR4`
	fn synthetic_dump(cpus: u32) -> String {
		(0..cpus)
			.map(|cpu| {
				format!(
					"CPU#{cpu}\nRAX=0000000000000000 RBX=0000000000000001\nCR0=80050033 CR1={cpu:x}ff CR2=7f0000{cpu:02x} \
					 CR3=000000000bc6e000 CR4=000006f0\nDR0=0000000000000000\n"
				)
			})
			.collect()
	}

	#[test]
	fn parse_and_write_blocks() {
		const CPUS: u32 = 4;
		let cpus = self::parse(&self::synthetic_dump(CPUS)).expect("Unable to parse");
		assert_eq!(cpus.len(), CPUS as usize);

		let mut output = vec![];
		self::write(&mut output, &cpus).expect("Unable to write");
		let output = String::from_utf8(output).expect("Output wasn't utf-8");
		let lines = output.lines().collect::<Vec<_>>();

		assert_eq!(lines.len(), CPUS as usize * (1 + CONTROL_REGISTERS));
		for (cpu, block) in lines.chunks(1 + CONTROL_REGISTERS).enumerate() {
			assert_eq!(block[0], cpu.to_string());
			assert_eq!(block[1], "80050033");
			assert_eq!(block[2], "0");
			assert_eq!(block[3], format!("7f0000{cpu:02x}"));
			assert_eq!(block[4], "bc6e000");
			assert_eq!(block[5], "6f0");
		}
	}

	#[test]
	fn parse_without_reported_cr1() {
		let dump = "CPU#0\nCR0=80050033 CR2=00000000 CR3=0000000001a00000 CR4=00000020\n";
		let cpus = self::parse(dump).expect("Unable to parse");
		assert_eq!(cpus, [CpuRegisters {
			cpu:     0,
			control: [0x80050033, 0, 0, 0x1a00000, 0x20],
		}]);
	}

	#[test]
	fn missing_register_is_fatal() {
		let dump = "CPU#0\nCR0=80050033 CR2=0 CR3=1000 CR4=20\nCPU#1\nCR0=80050033 CR2=0 CR3=1000\n";
		let err = self::parse(dump).expect_err("Parsing should fail");
		assert!(matches!(err, RegisterError::Missing {
			cpu: 1,
			register: 4,
			found: 3,
			expected: 4,
		}));
	}

	#[test]
	fn no_cpus_is_fatal() {
		assert!(matches!(self::parse("(qemu) "), Err(RegisterError::NoCpus)));
	}
}
