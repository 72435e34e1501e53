//! Error types for sync operations
//!
//! Errors fall into a small number of classes with very different blast
//! radii: transient I/O is logged and the affected entry retried on the
//! next change event, peer errors tear down a single connection, and
//! fatal/corruption errors abort the whole process.

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for the sync engine
#[derive(Debug)]
pub enum SyncError {
	/// Transient local I/O error; the affected entry is skipped this round
	Io(io::Error),

	/// Unrecoverable local I/O error; the process must exit
	Fatal { message: String },

	/// On-disk state or an incoming diff is corrupted
	Corrupt { message: String },

	/// A peer violated the framing protocol; terminal for that peer only
	Protocol { message: String },

	/// Invalid configuration
	Config { message: String },

	/// Connection error (nested)
	Connection(ConnectionError),
}

impl SyncError {
	/// True for errors that must abort the process rather than a peer.
	pub fn is_fatal(&self) -> bool {
		matches!(self, SyncError::Fatal { .. } | SyncError::Corrupt { .. })
	}

	pub fn fatal(message: impl Into<String>) -> SyncError {
		SyncError::Fatal { message: message.into() }
	}

	pub fn corrupt(message: impl Into<String>) -> SyncError {
		SyncError::Corrupt { message: message.into() }
	}

	pub fn protocol(message: impl Into<String>) -> SyncError {
		SyncError::Protocol { message: message.into() }
	}

	pub fn config(message: impl Into<String>) -> SyncError {
		SyncError::Config { message: message.into() }
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Fatal { message } => write!(f, "Fatal: {}", message),
			SyncError::Corrupt { message } => write!(f, "Corrupted state: {}", message),
			SyncError::Protocol { message } => write!(f, "Protocol error: {}", message),
			SyncError::Config { message } => write!(f, "Invalid configuration: {}", message),
			SyncError::Connection(e) => write!(f, "Connection error: {}", e),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io(e) => Some(e),
			SyncError::Connection(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ConnectionError> for SyncError {
	fn from(e: ConnectionError) -> Self {
		SyncError::Connection(e)
	}
}

/// Connection-specific errors
#[derive(Debug)]
pub enum ConnectionError {
	/// Subprocess spawn failed
	SpawnFailed { cmd: String, source: io::Error },

	/// A bootstrap step (mkdir, scp, rsync, launch) failed on the remote
	BootstrapFailed { host: String, message: String },

	/// The remote reported an operating system we cannot serve
	UnsupportedOs { host: String, uname: String },

	/// Stdio pipe unavailable on a spawned subprocess
	StdioUnavailable { what: String },

	/// Connection closed unexpectedly
	Disconnected,
}

impl fmt::Display for ConnectionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionError::SpawnFailed { cmd, source } => {
				write!(f, "Failed to spawn '{}': {}", cmd, source)
			}
			ConnectionError::BootstrapFailed { host, message } => {
				write!(f, "Bootstrap at {} failed: {}", host, message)
			}
			ConnectionError::UnsupportedOs { host, uname } => {
				write!(f, "Unknown os at {}: '{}'", host, uname)
			}
			ConnectionError::StdioUnavailable { what } => {
				write!(f, "Stdio unavailable: {}", what)
			}
			ConnectionError::Disconnected => write!(f, "Connection disconnected"),
		}
	}
}

impl Error for ConnectionError {}


// vim: ts=4
