//! Applying incoming changes to the local tree and metadata store.
//!
//! A `DIFF` payload is a concatenation of add/delete records. In
//! [`ApplyMode::Full`] the records mutate the tree (tmp-write + rename)
//! and then the metadata store; in [`ApplyMode::RepoOnly`] only the store
//! is advanced, which is how a locally produced diff is committed after
//! it has been handed to the dispatcher.
//!
//! Large files arrive out-of-band through the [`BigFileTable`]: an init
//! opens a hashed temp file, chunks append to it, and a commit renames it
//! into place. The table is owned by one peer's applier and torn down
//! with it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::SyncError;
use crate::logging::*;
use crate::protocol::{parse_len10, DIFF_SEP};
use crate::repo::{Repo, RepoChanges, REPO_TMP};
use crate::types::EntryStat;
use crate::util::big_tmp_name;

/// How far an incoming diff reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
	/// Mutate the tree, then advance the metadata store.
	Full,
	/// Advance the metadata store only (the tree already matches).
	RepoOnly,
}

/// Directory and basename of a relative slash-separated path.
fn split_dir(path: &str) -> (&str, &str) {
	match path.rsplit_once('/') {
		Some((dir, base)) => (dir, base),
		None => (".", path),
	}
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reject paths that could escape the mirrored tree.
fn validate_path(path: &str) -> Result<(), SyncError> {
	if path.is_empty() {
		return Err(SyncError::protocol("empty path in diff"));
	}
	if path.starts_with('/') {
		return Err(SyncError::protocol(format!("absolute path in diff: {}", path)));
	}
	for component in Path::new(path).components() {
		if component == std::path::Component::ParentDir {
			return Err(SyncError::protocol(format!("parent traversal in diff: {}", path)));
		}
	}
	Ok(())
}

/// Apply one `DIFF` payload.
///
/// Caller must hold the repository lock.
pub async fn apply_diff(repo: &Repo, buf: &[u8], mode: ApplyMode) -> Result<(), SyncError> {
	debug!("Applying diff, length {}", buf.len());

	let sep = DIFF_SEP.as_bytes();
	let mut offset = 0;
	let mut changes = RepoChanges::new();

	while offset < buf.len() {
		let end = match find(&buf[offset..], sep) {
			Some(pos) => offset + pos,
			None => return Err(SyncError::corrupt("diff record without separator")),
		};

		let chunk = &buf[offset..end];
		offset = end + sep.len();

		if chunk.len() < 3 || chunk[1] != b' ' {
			return Err(SyncError::corrupt("malformed diff record header"));
		}

		let (path, stat) = match chunk[0] {
			b'A' => {
				let newline = find(chunk, b"\n")
					.ok_or_else(|| SyncError::corrupt("no stat line in add record"))?;
				let path = std::str::from_utf8(&chunk[2..newline])
					.map_err(|_| SyncError::corrupt("non-UTF-8 path in diff"))?;
				let stat_str = std::str::from_utf8(&chunk[newline + 1..])
					.map_err(|_| SyncError::corrupt("non-UTF-8 stat in diff"))?;
				(path, Some(EntryStat::deserialize(stat_str)))
			}
			b'D' => {
				let path = std::str::from_utf8(&chunk[2..])
					.map_err(|_| SyncError::corrupt("non-UTF-8 path in diff"))?;
				(path, None)
			}
			op => {
				return Err(SyncError::corrupt(format!("unknown operation in diff: {}", op as char)))
			}
		};

		validate_path(path)?;

		let contents = match &stat {
			Some(stat) if !stat.is_dir && stat.size > 0 => {
				let size = stat.size as usize;
				if offset + size > buf.len() {
					return Err(SyncError::corrupt("diff payload shorter than declared size"));
				}
				let contents = &buf[offset..offset + size];
				offset += size;
				contents
			}
			_ => &[][..],
		};

		if mode == ApplyMode::Full {
			match &stat {
				Some(stat) => write_contents(repo.root(), path, stat, contents).await,
				None => {
					let abs = repo.root().join(path);
					match remove_any(&abs).await {
						Ok(()) => {}
						Err(e) if e.kind() == ErrorKind::NotFound => {}
						Err(e) => warn!("Cannot remove {}: {}", path, e),
					}
				}
			}
		}

		let (dir, base) = split_dir(path);
		changes
			.entry(PathBuf::from(dir))
			.or_default()
			.insert(base.to_string(), stat);
	}

	repo.apply_changes(&changes).await
}

/// Remove a path regardless of its kind.
async fn remove_any(abs: &Path) -> std::io::Result<()> {
	match fs::symlink_metadata(abs).await {
		Ok(meta) if meta.is_dir() => fs::remove_dir_all(abs).await,
		Ok(_) => fs::remove_file(abs).await,
		Err(e) => Err(e),
	}
}

/// Materialize one added/changed entry. Failures are logged and the entry
/// skipped; the sender will describe the path again on its next change.
async fn write_contents(root: &Path, path: &str, stat: &EntryStat, contents: &[u8]) {
	let abs = root.join(path);

	// An existing entry of a different kind cannot be replaced by rename.
	match fs::symlink_metadata(&abs).await {
		Ok(meta) => {
			if meta.is_dir() != stat.is_dir || meta.file_type().is_symlink() {
				if let Err(e) = remove_any(&abs).await {
					warn!("Cannot remove {}: {}", path, e);
					return;
				}
			}
		}
		Err(e) if e.kind() == ErrorKind::NotFound => {}
		Err(e) => {
			warn!("Error doing lstat for {}: {}", path, e);
			return;
		}
	}

	if stat.is_dir {
		if let Err(e) = fs::create_dir_all(&abs).await {
			warn!("Cannot create dir {}: {}", path, e);
			return;
		}
		if let Err(e) =
			fs::set_permissions(&abs, std::fs::Permissions::from_mode(stat.mode)).await
		{
			warn!("Cannot chmod {}: {}", path, e);
		}
	} else if stat.is_symlink {
		let _ = fs::remove_file(&abs).await;
		let target = String::from_utf8_lossy(contents).into_owned();
		if let Err(e) = fs::symlink(&target, &abs).await {
			warn!("Cannot create symlink {} -> {}: {}", path, target, e);
		}
	} else {
		write_file(root, &abs, path, stat, contents).await;
	}
}

/// Write a regular file through a temp name in the staging directory so
/// the final rename is atomic.
async fn write_file(root: &Path, abs: &Path, path: &str, stat: &EntryStat, contents: &[u8]) {
	let base = match abs.file_name() {
		Some(b) => b.to_os_string(),
		None => {
			warn!("Path has no filename: {}", path);
			return;
		}
	};
	let tmp = root.join(REPO_TMP).join(base);

	if let Err(e) = fs::write(&tmp, contents).await {
		warn!("Cannot write {}: {}", tmp.display(), e);
		return;
	}
	if let Err(e) = fs::set_permissions(&tmp, std::fs::Permissions::from_mode(stat.mode)).await {
		warn!("Cannot chmod {}: {}", tmp.display(), e);
		let _ = fs::remove_file(&tmp).await;
		return;
	}

	if let Some(parent) = abs.parent() {
		if let Err(e) = fs::create_dir_all(parent).await {
			warn!("Cannot create dir {}: {}", parent.display(), e);
			let _ = fs::remove_file(&tmp).await;
			return;
		}
	}

	if let Err(e) =
		filetime::set_file_mtime(&tmp, filetime::FileTime::from_unix_time(stat.mtime, 0))
	{
		warn!("Failed to change modification time for {}: {}", path, e);
	}

	if let Err(e) = fs::rename(&tmp, &abs).await {
		warn!("Cannot rename {} to {}: {}", tmp.display(), path, e);
		let _ = fs::remove_file(&tmp).await;
		return;
	}

	debug!("Wrote {} {}", path, stat.serialize());
}

/// `len10(path) path rest` — the common prefix of BIGRCV and BIGCOMMIT
/// payloads.
fn parse_path_prefixed(payload: &[u8]) -> Result<(&str, &[u8]), SyncError> {
	if payload.len() < 10 {
		return Err(SyncError::protocol("short big-file payload"));
	}
	let path_len = parse_len10(&payload[..10])?;
	if payload.len() < 10 + path_len {
		return Err(SyncError::protocol("big-file payload shorter than its path"));
	}
	let path = std::str::from_utf8(&payload[10..10 + path_len])
		.map_err(|_| SyncError::protocol("non-UTF-8 path in big-file payload"))?;
	Ok((path, &payload[10 + path_len..]))
}

struct BigFile {
	file: fs::File,
	tmp_name: PathBuf,
}

/// In-flight large transfers on the receiving side, keyed by destination
/// path. Owned by exactly one peer's applier.
pub struct BigFileTable {
	root: PathBuf,
	files: HashMap<String, BigFile>,
}

impl BigFileTable {
	pub fn new(root: impl Into<PathBuf>) -> BigFileTable {
		BigFileTable { root: root.into(), files: HashMap::new() }
	}

	/// BIGINIT: open the hashed temp file for the destination path.
	pub async fn init(&mut self, payload: &[u8]) -> Result<(), SyncError> {
		let path = std::str::from_utf8(payload)
			.map_err(|_| SyncError::protocol("non-UTF-8 path in big-file init"))?;
		validate_path(path)?;

		let tmp_name = big_tmp_name(&self.root, path);
		let file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&tmp_name)
			.await?;

		self.files.insert(path.to_string(), BigFile { file, tmp_name });
		Ok(())
	}

	/// BIGRCV: append one chunk.
	pub async fn receive(&mut self, payload: &[u8]) -> Result<(), SyncError> {
		let (path, chunk) = parse_path_prefixed(payload)?;
		let big = self
			.files
			.get_mut(path)
			.ok_or_else(|| SyncError::protocol(format!("chunk for unknown file: {}", path)))?;
		big.file.write_all(chunk).await?;
		Ok(())
	}

	/// BIGCOMMIT: finalize the temp file and move it into place.
	///
	/// Caller must hold the repository lock.
	pub async fn commit(&mut self, repo: &Repo, payload: &[u8]) -> Result<(), SyncError> {
		let (path, stat_bytes) = parse_path_prefixed(payload)?;
		let path = path.to_string();
		let stat_str = std::str::from_utf8(stat_bytes)
			.map_err(|_| SyncError::protocol("non-UTF-8 stat in big-file commit"))?;
		let stat = EntryStat::deserialize(stat_str);

		let big = self
			.files
			.remove(&path)
			.ok_or_else(|| SyncError::protocol(format!("commit for unknown file: {}", path)))?;

		let mut file = big.file;
		file.flush().await?;
		file.sync_all().await?;
		drop(file);

		fs::set_permissions(&big.tmp_name, std::fs::Permissions::from_mode(stat.mode)).await?;
		filetime::set_file_mtime(
			&big.tmp_name,
			filetime::FileTime::from_unix_time(stat.mtime, 0),
		)?;

		let abs = self.root.join(&path);
		if let Some(parent) = abs.parent() {
			fs::create_dir_all(parent).await?;
		}
		fs::rename(&big.tmp_name, &abs).await?;

		repo.commit_single(Path::new(&path), Some(stat)).await?;
		info!("Committed big file {}", path);
		Ok(())
	}

	/// BIGABORT: drop the temp file.
	pub async fn abort(&mut self, payload: &[u8]) -> Result<(), SyncError> {
		let path = std::str::from_utf8(payload)
			.map_err(|_| SyncError::protocol("non-UTF-8 path in big-file abort"))?;
		let big = self
			.files
			.remove(path)
			.ok_or_else(|| SyncError::protocol(format!("abort for unknown file: {}", path)))?;

		drop(big.file);
		let _ = fs::remove_file(&big.tmp_name).await;
		debug!("Aborted big file {}", path);
		Ok(())
	}

	/// Drop every in-flight transfer; used when the peer goes away.
	pub async fn cleanup(&mut self) {
		for (path, big) in self.files.drain() {
			drop(big.file);
			let _ = fs::remove_file(&big.tmp_name).await;
			debug!("Dropped unfinished big file {}", path);
		}
	}
}


// vim: ts=4
