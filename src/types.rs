//! The per-entry stat record and its textual serialization.
//!
//! An [`EntryStat`] describes one directory entry the way the engine last
//! observed it: entry kind, permission bits, modification time and size.
//! The textual form is what gets persisted in per-directory records and
//! carried inside diff headers, so it must stay byte-stable.

use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;

/// Description of one directory entry.
///
/// `is_dir` and `is_symlink` are mutually exclusive. For directories the
/// size is stored as 0 and never compared; for symlinks the size is the
/// length of the link target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
	pub is_dir: bool,
	pub is_symlink: bool,
	/// POSIX permission word, masked to the 9 rwx bits.
	pub mode: u32,
	/// Seconds since epoch.
	pub mtime: i64,
	pub size: u64,
}

impl EntryStat {
	/// Build a stat from an `lstat` result.
	pub fn from_metadata(meta: &std::fs::Metadata) -> EntryStat {
		let is_dir = meta.is_dir();
		EntryStat {
			is_dir,
			is_symlink: meta.file_type().is_symlink(),
			mode: meta.permissions().mode() & 0o777,
			mtime: meta.mtime(),
			size: if is_dir { 0 } else { meta.len() },
		}
	}

	/// Textual form: `[dir ][symlink ]mode=<octal> mtime=<dec> size=<dec>`.
	pub fn serialize(&self) -> String {
		let mut res = String::new();
		if self.is_dir {
			res.push_str("dir ");
		}
		if self.is_symlink {
			res.push_str("symlink ");
		}
		res.push_str(&format!("mode={:o} mtime={} size={}", self.mode, self.mtime, self.size));
		res
	}

	/// Parse the textual form. Unknown tokens are ignored and missing
	/// fields default to zero, so records written by older builds stay
	/// readable.
	pub fn deserialize(input: &str) -> EntryStat {
		let mut result =
			EntryStat { is_dir: false, is_symlink: false, mode: 0, mtime: 0, size: 0 };

		for part in input.split(' ') {
			if part == "dir" {
				result.is_dir = true;
			} else if part == "symlink" {
				result.is_symlink = true;
			} else if let Some(v) = part.strip_prefix("mode=") {
				result.mode = u32::from_str_radix(v, 8).unwrap_or(0);
			} else if let Some(v) = part.strip_prefix("mtime=") {
				result.mtime = v.parse().unwrap_or(0);
			} else if let Some(v) = part.strip_prefix("size=") {
				result.size = v.parse().unwrap_or(0);
			}
		}

		result
	}

	/// Comparison used for change detection.
	///
	/// Entry kind always matters. Mode is ignored for symlinks (it cannot
	/// be set portably), mtime is ignored for symlinks and directories,
	/// and size is ignored for directories.
	pub fn stats_equal(&self, other: &EntryStat) -> bool {
		if self.is_dir != other.is_dir {
			return false;
		}
		if self.is_symlink != other.is_symlink {
			return false;
		}
		if !self.is_symlink && self.mode != other.mode {
			return false;
		}
		if !self.is_symlink && !self.is_dir && self.mtime != other.mtime {
			return false;
		}
		if !self.is_dir && self.size != other.size {
			return false;
		}
		true
	}
}


// vim: ts=4
