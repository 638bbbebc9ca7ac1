//! Guest-physical memory map

// Imports
use {
	anyhow::Context,
	itertools::Itertools,
	std::{
		fmt,
		fs,
		io::{self, Write},
		path::{Path, PathBuf},
	},
};

/// Memory region, `[start, end)` in guest-physical addresses
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MemoryRegion {
	pub start: u64,
	pub end:   u64,
}

impl MemoryRegion {
	/// Returns the size of this region, in bytes.
	///
	/// Inverted regions have size `0`.
	pub fn size(&self) -> u64 {
		self.end.saturating_sub(self.start)
	}

	/// Returns the file, inside of `dir`, this region's memory is dumped to.
	///
	/// Distinct regions always map to distinct files.
	pub fn dump_path(&self, dir: &Path) -> PathBuf {
		dir.join(format!("{:x}-{:x}", self.start, self.end))
	}
}

impl fmt::Display for MemoryRegion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:x}-{:x}", self.start, self.end)
	}
}

/// Checks that `regions` are all non-empty and don't overlap each other
pub fn validate(regions: &[MemoryRegion]) -> Result<(), anyhow::Error> {
	for region in regions {
		anyhow::ensure!(region.start < region.end, "Region {region} is empty or inverted");
	}

	let mut sorted = regions.to_vec();
	sorted.sort_by_key(|region| region.start);
	for (prev, next) in sorted.iter().tuple_windows() {
		anyhow::ensure!(prev.end <= next.start, "Regions {prev} and {next} overlap");
	}

	Ok(())
}

/// Writes the memory map to `writer`.
///
/// The first line is the number of regions, in hex, followed by one
/// `<start>-<end>` line per region, in the order given.
pub fn write<W: io::Write>(writer: &mut W, regions: &[MemoryRegion]) -> Result<(), io::Error> {
	writeln!(writer, "{:x}", regions.len())?;
	for region in regions {
		writeln!(writer, "{region}")?;
	}

	Ok(())
}

/// Writes the memory map to the file at `path`
pub fn write_file(path: &Path, regions: &[MemoryRegion]) -> Result<(), anyhow::Error> {
	let mut file = io::BufWriter::new(fs::File::create(path).context("Unable to create memory map file")?);
	self::write(&mut file, regions).context("Unable to write memory map")?;
	file.flush().context("Unable to flush memory map file")?;

	Ok(())
}
