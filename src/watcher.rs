//! Bridge from the platform filesystem notifier to the engine's event
//! stream.
//!
//! The engine consumes a plain stream of changed paths plus one marker
//! that the watcher is up; everything platform-specific stays behind the
//! `notify` crate. Coalescing happens downstream, so raw events are
//! forwarded as they come.

use std::path::Path;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::logging::*;

/// One item of the watcher stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
	/// The watcher is registered; the baseline scan may start.
	Initialized,
	/// Something changed at or below this path.
	Changed(String),
}

/// Start watching `root` recursively. The returned watcher must be kept
/// alive for as long as events are wanted.
pub fn spawn_watcher(
	root: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FsEvent>), SyncError> {
	let (tx, rx) = mpsc::unbounded_channel();

	let event_tx = tx.clone();
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		match res {
			Ok(event) => {
				if event.kind.is_access() {
					return;
				}
				for path in event.paths {
					let _ = event_tx.send(FsEvent::Changed(path.to_string_lossy().into_owned()));
				}
			}
			Err(e) => warn!("Watcher error: {}", e),
		}
	})
	.map_err(|e| SyncError::fatal(format!("cannot create watcher: {}", e)))?;

	watcher
		.watch(root, RecursiveMode::Recursive)
		.map_err(|e| SyncError::fatal(format!("cannot watch {}: {}", root.display(), e)))?;

	let _ = tx.send(FsEvent::Initialized);

	Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;
	use tokio::time::{timeout, Duration};

	#[tokio::test]
	async fn test_initialized_comes_first() {
		let tmp = TempDir::new().unwrap();
		let (_watcher, mut rx) = spawn_watcher(tmp.path()).unwrap();

		let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
		assert_eq!(first, FsEvent::Initialized);
	}

	#[tokio::test]
	async fn test_change_is_reported() {
		let tmp = TempDir::new().unwrap();
		let (_watcher, mut rx) = spawn_watcher(tmp.path()).unwrap();

		let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
		assert_eq!(first, FsEvent::Initialized);

		std::fs::write(tmp.path().join("new.txt"), b"x").unwrap();

		let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
		match event {
			FsEvent::Changed(path) => assert!(path.contains("new.txt") || !path.is_empty()),
			other => panic!("unexpected event {:?}", other),
		}
	}
}

// vim: ts=4
