//! Change detection: walking watched directories and comparing them
//! against the metadata store.
//!
//! A scan handles deletions before additions (a path that turned from
//! directory into file must be removed before it can be re-described),
//! and recurses into new directories before emitting the parent entry so
//! a crash never leaves a parent record pointing at undescribed children.

use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;

use crate::diff::DiffSender;
use crate::dispatch::DispatchHandle;
use crate::error::SyncError;
use crate::logging::*;
use crate::repo::Repo;
use crate::types::EntryStat;

type BoxedScan<'a> = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>>;

/// Relative path of `name` inside `dir`, with `.` as the tree root.
fn join_rel(dir: &str, name: &str) -> String {
	if dir == "." {
		name.to_string()
	} else {
		format!("{}/{}", dir, name)
	}
}

/// The scanning half of the engine: owns the diff sender and runs change
/// detection over batches of directories.
pub struct Syncer {
	repo: Repo,
	excludes: Arc<HashSet<String>>,
	pub diff: DiffSender,
}

impl Syncer {
	pub fn new(repo: Repo, excludes: Arc<HashSet<String>>, dispatch: DispatchHandle) -> Syncer {
		let diff = DiffSender::new(repo.clone(), dispatch);
		Syncer { repo, excludes, diff }
	}

	/// True when any component of `path` is an excluded name.
	fn excluded(&self, path: &str) -> bool {
		path.split('/').any(|part| !part.is_empty() && self.excludes.contains(part))
	}

	/// Full recursive scan that records the current tree without emitting
	/// diffs. Run once at startup, before any change events are handled.
	pub async fn baseline(&mut self) -> Result<(), SyncError> {
		self.diff.begin(self.repo.acquire().await);
		let result = self.scan(".".to_string(), true, false).await;
		self.diff.end();
		result
	}

	/// Scan a batch of changed directories and emit the differences as
	/// diffs. The whole batch runs under the repository lock; the flush
	/// path briefly releases it around the dispatcher hand-off.
	pub async fn sync_batch(
		&mut self,
		dirs: impl IntoIterator<Item = String>,
	) -> Result<(), SyncError> {
		let dirs: Vec<String> = dirs.into_iter().filter(|d| !self.excluded(d)).collect();
		if dirs.is_empty() {
			return Ok(());
		}

		info!("Changed dirs: {}", dirs.join("; "));

		self.diff.begin(self.repo.acquire().await);
		let result = self.scan_batch_inner(dirs).await;
		self.diff.end();
		result
	}

	async fn scan_batch_inner(&mut self, dirs: Vec<String>) -> Result<(), SyncError> {
		for dir in dirs {
			// The directory may have vanished or become a file since the
			// event fired; such paths are simply not scannable yet.
			match fs::symlink_metadata(self.repo.root().join(&dir)).await {
				Ok(meta) if meta.is_dir() => {}
				_ => continue,
			}
			self.scan(dir, false, true).await?;
		}
		self.diff.flush().await
	}

	/// Scan one directory. With `recursive`, descend into every changed
	/// child directory; otherwise only into children that are new or were
	/// previously not directories. With `emit`, stage a diff record per
	/// change; without it, persist the updated record directly (the
	/// emitting path advances the store when the diff is flushed).
	fn scan(&mut self, dir: String, recursive: bool, emit: bool) -> BoxedScan<'_> {
		Box::pin(async move {
			if self.excluded(&dir) {
				return Ok(());
			}

			let abs = self.repo.root().join(&dir);
			let meta = match fs::metadata(&abs).await {
				Ok(meta) => meta,
				Err(e) => {
					debug!("Cannot open {}: {}", dir, e);
					return Ok(());
				}
			};
			if !meta.is_dir() {
				debug!("Suddenly {} stopped being a directory", dir);
				return Ok(());
			}

			let dir_path = PathBuf::from(&dir);
			let mut record = self.repo.load(&dir_path).await?;
			let mut changes = 0usize;

			// Deletions first: a former directory entry must disappear
			// before a file of the same name can be described.
			let known: Vec<String> = record.keys().cloned().collect();
			for name in known {
				match fs::symlink_metadata(abs.join(&name)).await {
					Ok(_) => {}
					Err(e) if e.kind() == ErrorKind::NotFound => {
						record.remove(&name);
						changes += 1;
						debug!("Deleted: {}/{}", dir, name);
						if emit {
							self.diff.add_entry(&join_rel(&dir, &name), None).await?;
						}
					}
					Err(e) => {
						// Permission errors on entries we recorded are not
						// survivable; the store would drift from the tree.
						return Err(SyncError::fatal(format!(
							"could not lstat {}/{}: {}",
							dir, name, e
						)));
					}
				}
			}

			let mut entries = match fs::read_dir(&abs).await {
				Ok(rd) => rd,
				Err(e) => {
					warn!("Could not read directory {}: {}", dir, e);
					return Ok(());
				}
			};

			loop {
				let entry = match entries.next_entry().await {
					Ok(Some(entry)) => entry,
					Ok(None) => break,
					Err(e) => {
						warn!("Could not read directory names from {}: {}", dir, e);
						break;
					}
				};

				let name = match entry.file_name().to_str() {
					Some(name) => name.to_string(),
					None => {
						warn!("Skipping entry with non-UTF-8 name in {}", dir);
						continue;
					}
				};
				if name.contains('\n') {
					warn!("Skipping {:?} in {}: newline in name", name, dir);
					continue;
				}
				if self.excludes.contains(&name) {
					continue;
				}

				let entry_meta = match entry.metadata().await {
					Ok(meta) => meta,
					Err(e) if e.kind() == ErrorKind::NotFound => continue,
					Err(e) => {
						warn!("Cannot stat {}/{}: {}", dir, name, e);
						continue;
					}
				};

				let live = EntryStat::from_metadata(&entry_meta);
				let stored = record.get(&name).copied();
				if stored.map_or(false, |s| s.stats_equal(&live)) {
					continue;
				}

				// Children before parents: descend first so the records
				// below this one are already consistent when this entry
				// goes out.
				if live.is_dir && (recursive || stored.map_or(true, |s| !s.is_dir)) {
					self.scan(join_rel(&dir, &name), true, emit).await?;
				}

				debug!(
					"{}: {}/{}",
					if stored.is_some() { "Changed" } else { "Added" },
					dir,
					name
				);

				record.insert(name.clone(), live);
				changes += 1;
				if emit {
					self.diff.add_entry(&join_rel(&dir, &name), Some(&live)).await?;
				}
			}

			if changes > 0 && !emit {
				self.repo.commit(&dir_path, &record).await?;
			}

			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dispatch;
	use crate::repo::{REPO_FILES, REPO_TMP};
	use std::path::Path;
	use tempfile::TempDir;

	fn setup(tmp: &TempDir) -> (Repo, Syncer) {
		std::fs::create_dir_all(tmp.path().join(REPO_TMP)).unwrap();
		std::fs::create_dir_all(tmp.path().join(REPO_FILES)).unwrap();
		let repo = Repo::new(tmp.path());
		let excludes = Arc::new(HashSet::from([".sync".to_string()]));
		let syncer = Syncer::new(repo.clone(), excludes, dispatch::spawn(None));
		(repo, syncer)
	}

	#[tokio::test]
	async fn test_baseline_records_tree() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::create_dir(tmp.path().join("a")).unwrap();
		std::fs::write(tmp.path().join("a/b.txt"), b"hi\n").unwrap();
		std::fs::write(tmp.path().join("top.txt"), b"x").unwrap();

		syncer.baseline().await.unwrap();

		let root = repo.load(Path::new(".")).await.unwrap();
		assert!(root.contains_key("a"));
		assert!(root.contains_key("top.txt"));
		assert!(root["a"].is_dir);

		let sub = repo.load(Path::new("a")).await.unwrap();
		assert_eq!(sub["b.txt"].size, 3);
	}

	#[tokio::test]
	async fn test_baseline_skips_excluded() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::write(tmp.path().join("keep.txt"), b"y").unwrap();

		syncer.baseline().await.unwrap();

		let root = repo.load(Path::new(".")).await.unwrap();
		assert!(root.contains_key("keep.txt"));
		assert!(!root.contains_key(".sync"));
	}

	#[tokio::test]
	async fn test_rescan_detects_deletion() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::write(tmp.path().join("f.txt"), b"z").unwrap();
		syncer.baseline().await.unwrap();

		std::fs::remove_file(tmp.path().join("f.txt")).unwrap();
		syncer.sync_batch(vec![".".to_string()]).await.unwrap();

		let root = repo.load(Path::new(".")).await.unwrap();
		assert!(!root.contains_key("f.txt"));
	}

	#[tokio::test]
	async fn test_rescan_detects_modification() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::write(tmp.path().join("f.txt"), b"one").unwrap();
		syncer.baseline().await.unwrap();

		std::fs::write(tmp.path().join("f.txt"), b"three").unwrap();
		filetime::set_file_mtime(
			tmp.path().join("f.txt"),
			filetime::FileTime::from_unix_time(1700000123, 0),
		)
		.unwrap();
		syncer.sync_batch(vec![".".to_string()]).await.unwrap();

		let root = repo.load(Path::new(".")).await.unwrap();
		assert_eq!(root["f.txt"].size, 5);
		assert_eq!(root["f.txt"].mtime, 1700000123);
	}

	#[tokio::test]
	async fn test_dir_to_file_transition() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::create_dir(tmp.path().join("thing")).unwrap();
		std::fs::write(tmp.path().join("thing/inner"), b"i").unwrap();
		syncer.baseline().await.unwrap();

		std::fs::remove_dir_all(tmp.path().join("thing")).unwrap();
		std::fs::write(tmp.path().join("thing"), b"now a file").unwrap();
		syncer.sync_batch(vec![".".to_string()]).await.unwrap();

		let root = repo.load(Path::new(".")).await.unwrap();
		assert!(!root["thing"].is_dir);
		// The old directory's metadata subtree went away with it.
		assert!(!tmp.path().join(REPO_FILES).join("thing").exists());
	}

	#[tokio::test]
	async fn test_new_nested_directory_scanned_depth_first() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		syncer.baseline().await.unwrap();

		std::fs::create_dir_all(tmp.path().join("x/y")).unwrap();
		std::fs::write(tmp.path().join("x/y/z.txt"), b"deep").unwrap();
		// Only the top directory is reported, as a watcher would.
		syncer.sync_batch(vec![".".to_string()]).await.unwrap();

		assert!(repo.load(Path::new(".")).await.unwrap().contains_key("x"));
		assert!(repo.load(Path::new("x")).await.unwrap().contains_key("y"));
		assert!(repo.load(Path::new("x/y")).await.unwrap().contains_key("z.txt"));
	}

	#[tokio::test]
	async fn test_newline_in_name_rejected() {
		let tmp = TempDir::new().unwrap();
		let (repo, mut syncer) = setup(&tmp);

		std::fs::write(tmp.path().join("bad\nname"), b"x").unwrap();
		std::fs::write(tmp.path().join("good"), b"y").unwrap();

		syncer.baseline().await.unwrap();

		// A name carrying the record separator can never enter the store.
		let root = repo.load(Path::new(".")).await.unwrap();
		assert!(root.contains_key("good"));
		assert_eq!(root.len(), 1);
	}

	#[tokio::test]
	async fn test_excluded_batch_is_noop() {
		let tmp = TempDir::new().unwrap();
		let (_repo, mut syncer) = setup(&tmp);
		syncer.sync_batch(vec![".sync/files".to_string()]).await.unwrap();
	}

	#[test]
	fn test_join_rel() {
		assert_eq!(join_rel(".", "a"), "a");
		assert_eq!(join_rel("a", "b"), "a/b");
		assert_eq!(join_rel("a/b", "c"), "a/b/c");
	}
}

// vim: ts=4
