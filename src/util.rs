//! Small shared helpers.

use sha::sha1::Sha1 as Sha;
use sha::utils::{Digest, DigestExt};
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use crate::repo::REPO_TMP;

/// Hex sha1 of a byte slice.
pub fn hash(buf: &[u8]) -> String {
	let mut hasher = Sha::default();
	hasher.digest(buf);
	let _ = hasher.finish();
	hasher.to_hex()
}

/// Temp-file path for an incoming big transfer.
///
/// Derived by hashing the destination path so two concurrent transfers
/// for different destinations never collide inside the staging directory.
pub fn big_tmp_name(root: &Path, path: &str) -> PathBuf {
	root.join(REPO_TMP).join(format!("big_{}", hash(path.as_bytes())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hash_known_vector() {
		// echo -n 12 | sha1sum
		assert_eq!(hash(b"12"), "7b52009b64fd0a2a49e6d8a939753077792b0554");
	}

	#[test]
	fn test_hash_empty() {
		// echo -n "" | sha1sum
		assert_eq!(hash(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
	}

	#[test]
	fn test_big_tmp_name_distinct() {
		let root = Path::new("/r");
		let a = big_tmp_name(root, "a/b.bin");
		let b = big_tmp_name(root, "a/c.bin");
		assert_ne!(a, b);
		assert!(a.starts_with("/r/.sync/tmp"));
	}

	#[test]
	fn test_big_tmp_name_stable() {
		let root = Path::new(".");
		assert_eq!(big_tmp_name(root, "x"), big_tmp_name(root, "x"));
	}
}

// vim: ts=4
