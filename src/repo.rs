//! Repository metadata store: the engine's persistent knowledge of the
//! tree it mirrors.
//!
//! Every watched directory `d` has a record at `.sync/files/<d>/meta`
//! mapping entry names to their last observed [`EntryStat`]. The records
//! are the source of truth for change detection: a scan compares the live
//! tree against them and emits diffs for the differences.
//!
//! All commits happen under the single repository lock. Since reads and
//! writes are confined to this process under that lock, records are
//! written by plain open-truncate-write rather than rename.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::SyncError;
use crate::logging::*;
use crate::types::EntryStat;

pub const SYNC_DIR: &str = ".sync";
pub const REPO_FILES: &str = ".sync/files";
pub const REPO_TMP: &str = ".sync/tmp";
pub const REPO_PID: &str = ".sync/pid";
pub const REPO_OUT_LOG: &str = ".sync/out.log";
pub const CLIENT_CONFIG: &str = ".sync/client_config";

/// Separator between tokens in a directory record file.
pub const REPO_SEP: &str = "/\n";

/// Name of the record file inside `.sync/files/<dir>/`.
pub const META_FILE: &str = "meta";

/// In-memory form of one directory record.
pub type DirectoryRecord = BTreeMap<String, EntryStat>;

/// Per-directory changes to fold into the store: `None` removes an entry.
pub type RepoChanges = HashMap<PathBuf, HashMap<String, Option<EntryStat>>>;

/// Handle to the metadata store. Cheap to clone; all clones share the
/// repository lock.
#[derive(Clone)]
pub struct Repo {
	root: PathBuf,
	lock: Arc<Mutex<()>>,
}

impl Repo {
	/// `root` is the source tree root, the directory that contains `.sync`.
	pub fn new(root: impl Into<PathBuf>) -> Repo {
		Repo { root: root.into(), lock: Arc::new(Mutex::new(())) }
	}

	/// Acquire the repository lock. The guard is owned so callers can
	/// release it around a dispatcher hand-off and re-acquire afterwards.
	pub async fn acquire(&self) -> OwnedMutexGuard<()> {
		self.lock.clone().lock_owned().await
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn files_dir(&self, dir: &Path) -> PathBuf {
		self.root.join(REPO_FILES).join(dir)
	}

	/// Load the record for `dir`. An absent or near-empty file yields an
	/// empty record; a file with an odd token count is corruption.
	///
	/// Caller must hold the repository lock.
	pub async fn load(&self, dir: &Path) -> Result<DirectoryRecord, SyncError> {
		let filename = self.files_dir(dir).join(META_FILE);
		let mut record = DirectoryRecord::new();

		let contents = match fs::read_to_string(&filename).await {
			Ok(c) => c,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(record),
			Err(e) => return Err(e.into()),
		};

		if contents.len() < 2 {
			return Ok(record);
		}

		let elements: Vec<&str> = contents.split(REPO_SEP).collect();
		if elements.len() % 2 != 0 {
			return Err(SyncError::corrupt(format!(
				"inconsistent record file {}",
				filename.display()
			)));
		}

		for pair in elements.chunks(2) {
			record.insert(pair[0].to_string(), EntryStat::deserialize(pair[1]));
		}

		Ok(record)
	}

	/// Persist the record for `dir`, replacing whatever was stored.
	///
	/// When the commit drops a child that was recorded as a directory,
	/// the child's own metadata subtree is removed along with it so the
	/// store never describes directories that no longer exist.
	///
	/// Caller must hold the repository lock.
	pub async fn commit(&self, dir: &Path, record: &DirectoryRecord) -> Result<(), SyncError> {
		debug!("Committing record for {:?}", dir);

		let old_record = self.load(dir).await?;

		let repo_dir = self.files_dir(dir);
		fs::create_dir_all(&repo_dir).await?;

		for (name, stat) in &old_record {
			// A child that is gone, or no longer a directory, takes its
			// recorded subtree with it; stale records under the old name
			// would mask changes if a directory reappears there.
			let still_dir = record.get(name).map_or(false, |n| n.is_dir);
			if stat.is_dir && !still_dir {
				match fs::remove_dir_all(repo_dir.join(name)).await {
					Ok(()) => {}
					Err(e) if e.kind() == ErrorKind::NotFound => {}
					Err(e) => return Err(e.into()),
				}
			}
		}

		let mut tokens = Vec::with_capacity(record.len() * 2);
		for (name, stat) in record {
			tokens.push(name.clone());
			tokens.push(stat.serialize());
		}

		fs::write(repo_dir.join(META_FILE), tokens.join(REPO_SEP)).await?;
		Ok(())
	}

	/// Fold a batch of per-directory changes into the store.
	///
	/// A `None` stat removes the entry; if the entry was never recorded,
	/// any stale metadata subtree under its name is removed instead.
	///
	/// Caller must hold the repository lock.
	pub async fn apply_changes(&self, changes: &RepoChanges) -> Result<(), SyncError> {
		for (dir, filemap) in changes {
			let mut record = self.load(dir).await?;

			for (name, stat) in filemap {
				match stat {
					Some(stat) => {
						record.insert(name.clone(), *stat);
					}
					None => {
						if record.remove(name).is_none() {
							let stale = self.files_dir(dir).join(name);
							match fs::remove_dir_all(&stale).await {
								Ok(()) => {}
								Err(e) if e.kind() == ErrorKind::NotFound => {}
								Err(e) => {
									warn!("Cannot remove {:?}: {}", stale, e);
								}
							}
						}
					}
				}
			}

			self.commit(dir, &record).await?;
		}

		Ok(())
	}

	/// Record a single entry: load the parent record, set or remove the
	/// basename, commit.
	///
	/// Caller must hold the repository lock.
	pub async fn commit_single(
		&self,
		file: &Path,
		stat: Option<EntryStat>,
	) -> Result<(), SyncError> {
		let dir = match file.parent() {
			Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
			_ => PathBuf::from("."),
		};
		let name = file
			.file_name()
			.ok_or_else(|| SyncError::fatal(format!("no file name in {:?}", file)))?
			.to_string_lossy()
			.into_owned();

		let mut changes = RepoChanges::new();
		changes.entry(dir).or_default().insert(name, stat);
		self.apply_changes(&changes).await
	}
}


// vim: ts=4
