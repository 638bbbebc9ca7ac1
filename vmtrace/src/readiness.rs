//! Readiness synchronizer.
//!
//! A named posix semaphore that releases the simulator once instrumentation is
//! armed. Any process can open it by name.

// Imports
use std::{ffi::CString, io};

/// Readiness error
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
	#[error("Invalid semaphore name {0:?}")]
	Name(String),

	#[error("Unable to open semaphore {name:?}")]
	Open {
		name:   String,
		#[source]
		source: io::Error,
	},

	#[error("Unable to post semaphore {name:?}")]
	Post {
		name:   String,
		#[source]
		source: io::Error,
	},

	#[error("Unable to unlink semaphore {name:?}")]
	Unlink {
		name:   String,
		#[source]
		source: io::Error,
	},

	#[error("Unable to wait on semaphore {name:?}")]
	Wait {
		name:   String,
		#[source]
		source: io::Error,
	},
}

/// Signal that releases a waiting collaborator
pub trait ReadySignal {
	/// Releases exactly one waiter
	fn post(&mut self) -> Result<(), ReadinessError>;
}

/// Named counting semaphore
#[derive(Debug)]
pub struct NamedSemaphore {
	/// Name
	name: CString,

	/// Semaphore
	sem: *mut libc::sem_t,
}

impl NamedSemaphore {
	/// Creates the semaphore `name`, or opens it if it already exists.
	///
	/// `mode` and `initial` only apply if the semaphore is created.
	pub fn open(name: &str, mode: u32, initial: u32) -> Result<Self, ReadinessError> {
		let c_name = CString::new(name).map_err(|_| ReadinessError::Name(name.to_owned()))?;

		// SAFETY: `c_name` is a valid nul-terminated string, and the variadic
		//         arguments match what `O_CREAT` requires.
		let sem = unsafe {
			libc::sem_open(
				c_name.as_ptr(),
				libc::O_CREAT,
				mode as libc::c_uint,
				initial as libc::c_uint,
			)
		};
		if sem == libc::SEM_FAILED {
			return Err(ReadinessError::Open {
				name:   name.to_owned(),
				source: io::Error::last_os_error(),
			});
		}
		tracing::debug!(?name, mode, initial, "Opened semaphore");

		Ok(Self { name: c_name, sem })
	}

	/// Returns the name of this semaphore
	pub fn name(&self) -> String {
		self.name.to_string_lossy().into_owned()
	}

	/// Decrements the semaphore, if positive.
	///
	/// Returns whether it was decremented.
	pub fn try_wait(&self) -> Result<bool, ReadinessError> {
		loop {
			// SAFETY: `self.sem` is an open semaphore until we're dropped
			if unsafe { libc::sem_trywait(self.sem) } == 0 {
				return Ok(true);
			}

			let err = io::Error::last_os_error();
			match err.raw_os_error() {
				Some(libc::EAGAIN) => return Ok(false),
				Some(libc::EINTR) => continue,
				_ => {
					return Err(ReadinessError::Wait {
						name:   self.name(),
						source: err,
					})
				},
			}
		}
	}

	/// Drains any pending posts, returning how many there were
	pub fn drain(&self) -> Result<usize, ReadinessError> {
		let mut drained = 0;
		while self.try_wait()? {
			drained += 1;
		}

		Ok(drained)
	}

	/// Removes the name of this semaphore.
	///
	/// Processes that already opened it keep using it.
	pub fn unlink(&self) -> Result<(), ReadinessError> {
		// SAFETY: `self.name` is a valid nul-terminated string
		if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
			return Err(ReadinessError::Unlink {
				name:   self.name(),
				source: io::Error::last_os_error(),
			});
		}

		Ok(())
	}
}

impl ReadySignal for NamedSemaphore {
	fn post(&mut self) -> Result<(), ReadinessError> {
		// SAFETY: `self.sem` is an open semaphore until we're dropped
		if unsafe { libc::sem_post(self.sem) } != 0 {
			return Err(ReadinessError::Post {
				name:   self.name(),
				source: io::Error::last_os_error(),
			});
		}
		tracing::debug!(name = ?self.name, "Posted semaphore");

		Ok(())
	}
}

impl Drop for NamedSemaphore {
	fn drop(&mut self) {
		// SAFETY: `self.sem` was returned by `sem_open` and isn't used after this
		if unsafe { libc::sem_close(self.sem) } != 0 {
			tracing::warn!(name = ?self.name, err = ?io::Error::last_os_error(), "Unable to close semaphore");
		}
	}
}
