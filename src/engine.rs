//! Engine startup and the event loop gluing the pieces together.
//!
//! The same binary runs in two roles. The client loads the peer
//! configuration, bootstraps every peer and fans local changes out to
//! all of them; the server is launched remotely with its stdin/stdout as
//! its single peer stream. Both roles watch their tree (unless told not
//! to) and both apply whatever their peers send.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;

use crate::config;
use crate::dispatch::{self, DispatchHandle};
use crate::error::SyncError;
use crate::health;
use crate::logging::*;
use crate::outlog::OutLog;
use crate::peer;
use crate::repo::{Repo, CLIENT_CONFIG, REPO_FILES, REPO_OUT_LOG, REPO_PID, REPO_TMP, SYNC_DIR};
use crate::scan::Syncer;
use crate::transport::SshTransport;
use crate::watcher::{self, FsEvent};

/// Which side of a connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Client,
	Server,
}

/// Command-line options, already parsed.
#[derive(Debug, Clone)]
pub struct Options {
	pub server: bool,
	pub debug: bool,
	pub hostname: String,
	/// Apply-only mode: do not watch the local tree.
	pub no_watcher: bool,
	/// Do not bootstrap any peers (local record-keeping only).
	pub no_remote: bool,
	pub dir: Option<String>,
}

/// Shared engine state, threaded explicitly instead of living in statics.
pub struct Engine {
	pub root: PathBuf,
	pub role: Role,
	pub hostname: String,
	pub excludes: Arc<HashSet<String>>,
	pub repo: Repo,
	pub dispatch: DispatchHandle,
}

/// Delay between picking up the first changed path and scanning, so a
/// burst of events for the same directories becomes one batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Depth of the changed-directory queue.
const DIRS_QUEUE_DEPTH: usize = 1000;

/// Run the engine to completion. Returns only on clean shutdown or a
/// non-fatal startup error; fatal runtime errors exit the process.
pub async fn run(opts: Options) -> Result<(), SyncError> {
	if let Some(dir) = &opts.dir {
		std::env::set_current_dir(dir)
			.map_err(|e| SyncError::fatal(format!("cannot chdir to {}: {}", dir, e)))?;
	}
	let root = std::env::current_dir()?;

	let role = if opts.server { Role::Server } else { Role::Client };
	match role {
		Role::Server => {
			info!(hostname = %opts.hostname, "Sync server starting at {}", root.display())
		}
		Role::Client => info!("Sync starting from {}", root.display()),
	}

	prepare_layout(&root).await?;
	take_over_pid(&root).await?;

	let outlog = match role {
		Role::Client => Some(Arc::new(OutLog::create(root.join(REPO_OUT_LOG)).await?)),
		Role::Server => None,
	};
	let dispatch = dispatch::spawn(outlog);

	let (excludes, peers) = match role {
		Role::Client if !opts.no_remote => {
			let config = config::load(&root.join(CLIENT_CONFIG))?;
			(config.excludes, config.peers)
		}
		_ => (HashSet::from([SYNC_DIR.to_string()]), Vec::new()),
	};
	let excludes = Arc::new(excludes);

	let repo = Repo::new(root.clone());
	let engine = Arc::new(Engine {
		root: root.clone(),
		role,
		hostname: opts.hostname.clone(),
		excludes: Arc::clone(&excludes),
		repo,
		dispatch: dispatch.clone(),
	});

	if role == Role::Client && !opts.no_remote {
		let binary_dir = std::env::current_exe()
			.ok()
			.and_then(|exe| exe.parent().map(Path::to_path_buf))
			.unwrap_or_else(|| root.clone());
		let transport = Arc::new(SshTransport {
			source_dir: root.clone(),
			binary_dir,
			excludes: excludes.iter().cloned().collect(),
			debug: opts.debug,
		});
		for settings in peers {
			info!("Starting peer {}", settings.host);
			peer::spawn_client_peer(Arc::clone(&engine), settings, transport.clone());
		}
	}

	health::spawn_ping(dispatch.clone());

	// The server's single send stream must exist before the watcher can
	// produce a diff, or an early local change would be dropped.
	let server_stream = match role {
		Role::Server => {
			let id = dispatch.next_id();
			dispatch.add_peer(id, Box::new(tokio::io::stdout())).await;
			Some(id)
		}
		Role::Client => None,
	};

	if !opts.no_watcher {
		let (fs_watcher, events) = watcher::spawn_watcher(&root)?;
		let engine_for_events = Arc::clone(&engine);
		tokio::spawn(async move {
			event_loop(engine_for_events, fs_watcher, events).await;
		});
	}

	match role {
		Role::Server => {
			let (alive_tx, alive_rx) = mpsc::channel(16);
			health::spawn_watchdog(root.clone(), alive_rx);

			let peer_name =
				if opts.hostname.is_empty() { "client".to_string() } else { opts.hostname };
			let id = server_stream.unwrap_or_else(|| dispatch.next_id());
			let result = peer::apply_loop(
				engine,
				Box::new(tokio::io::BufReader::new(tokio::io::stdin())),
				id,
				peer_name,
				Some(alive_tx),
			)
			.await;

			// A server has nothing to reconnect to; any stream loss ends it.
			match result {
				Ok(()) => Ok(()),
				Err(e) => {
					Err(SyncError::fatal(format!("lost connection to remote side: {}", e)))
				}
			}
		}
		Role::Client => {
			tokio::signal::ctrl_c()
				.await
				.map_err(|e| SyncError::fatal(format!("cannot wait for signals: {}", e)))?;
			info!("Shutting down");
			let _ = fs::remove_file(root.join(REPO_PID)).await;
			Ok(())
		}
	}
}

/// Create the state layout, clearing leftovers from previous runs.
async fn prepare_layout(root: &Path) -> Result<(), SyncError> {
	let _ = fs::remove_dir_all(root.join(REPO_TMP)).await;
	for dir in [SYNC_DIR, REPO_FILES, REPO_TMP] {
		fs::create_dir_all(root.join(dir)).await?;
	}
	Ok(())
}

/// Stop a previous instance if its pid file is still around, then claim
/// the pid file for this process.
async fn take_over_pid(root: &Path) -> Result<(), SyncError> {
	let pid_path = root.join(REPO_PID);

	if let Ok(contents) = fs::read_to_string(&pid_path).await {
		if let Ok(pid) = contents.trim().parse::<u32>() {
			if pid != std::process::id() {
				info!("Stopping previous instance with pid {}", pid);
				let _ = tokio::process::Command::new("kill")
					.arg(pid.to_string())
					.status()
					.await;
			}
		}
	}

	fs::write(&pid_path, std::process::id().to_string()).await?;
	Ok(())
}

/// Consume watcher events: run the baseline scan once the watcher is up,
/// then feed changed directories to the coalescing sync loop.
async fn event_loop(
	engine: Arc<Engine>,
	_fs_watcher: notify::RecommendedWatcher,
	mut events: mpsc::UnboundedReceiver<FsEvent>,
) {
	let (dirs_tx, dirs_rx) = mpsc::channel(DIRS_QUEUE_DEPTH);
	let mut dirs_rx = Some(dirs_rx);
	let mut ready = false;

	while let Some(event) = events.recv().await {
		match event {
			FsEvent::Initialized => {
				let mut syncer = Syncer::new(
					engine.repo.clone(),
					Arc::clone(&engine.excludes),
					engine.dispatch.clone(),
				);
				if let Err(e) = syncer.baseline().await {
					error!("Cannot commit changes at .: {}", e);
					std::process::exit(1);
				}
				if let Some(rx) = dirs_rx.take() {
					tokio::spawn(sync_loop(syncer, rx));
				}
				ready = true;
				info!("Watcher ready");
			}
			FsEvent::Changed(path) if ready => {
				if let Some(dir) = dir_of_event(&engine.root, &path).await {
					let _ = dirs_tx.send(dir).await;
				}
			}
			FsEvent::Changed(_) => {}
		}
	}
}

/// Map one watcher path to the directory to rescan: relative to the
/// root, with a non-directory final component dropped.
async fn dir_of_event(root: &Path, raw: &str) -> Option<String> {
	let path = Path::new(raw);
	let rel = if path.is_absolute() {
		match path.strip_prefix(root) {
			Ok(rel) => rel.to_path_buf(),
			Err(_) => {
				warn!("Cannot compute relative path for {}", raw);
				return None;
			}
		}
	} else {
		path.to_path_buf()
	};

	let rel = match fs::symlink_metadata(root.join(&rel)).await {
		Ok(meta) if meta.is_dir() => rel,
		Ok(_) => rel.parent().map(Path::to_path_buf).unwrap_or_default(),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			rel.parent().map(Path::to_path_buf).unwrap_or_default()
		}
		Err(e) => {
			warn!("Stat failed for {}: {}", raw, e);
			return None;
		}
	};

	let dir = rel.to_string_lossy().into_owned();
	Some(if dir.is_empty() { ".".to_string() } else { dir })
}

/// Drain changed directories in ~100 ms batches and scan each batch.
async fn sync_loop(mut syncer: Syncer, mut dirs: mpsc::Receiver<String>) {
	let mut pending = HashSet::new();

	while let Some(first) = dirs.recv().await {
		pending.insert(first);
		tokio::time::sleep(COALESCE_WINDOW).await;
		while let Ok(dir) = dirs.try_recv() {
			pending.insert(dir);
		}

		let batch: Vec<String> = pending.drain().collect();
		if let Err(e) = syncer.sync_batch(batch).await {
			error!("Unrecoverable error, exiting: {}", e);
			std::process::exit(1);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_prepare_layout_clears_tmp() {
		let tmp = TempDir::new().unwrap();
		let stale = tmp.path().join(REPO_TMP).join("leftover");
		std::fs::create_dir_all(tmp.path().join(REPO_TMP)).unwrap();
		std::fs::write(&stale, b"junk").unwrap();

		prepare_layout(tmp.path()).await.unwrap();

		assert!(!stale.exists());
		assert!(tmp.path().join(REPO_FILES).is_dir());
		assert!(tmp.path().join(REPO_TMP).is_dir());
	}

	#[tokio::test]
	async fn test_pid_file_written() {
		let tmp = TempDir::new().unwrap();
		prepare_layout(tmp.path()).await.unwrap();
		take_over_pid(tmp.path()).await.unwrap();

		let contents = std::fs::read_to_string(tmp.path().join(REPO_PID)).unwrap();
		assert_eq!(contents.parse::<u32>().unwrap(), std::process::id());
	}

	#[tokio::test]
	async fn test_dir_of_event_drops_file_component() {
		let tmp = TempDir::new().unwrap();
		std::fs::create_dir(tmp.path().join("a")).unwrap();
		std::fs::write(tmp.path().join("a/f.txt"), b"x").unwrap();

		let abs = tmp.path().join("a/f.txt");
		let dir = dir_of_event(tmp.path(), abs.to_str().unwrap()).await;
		assert_eq!(dir.as_deref(), Some("a"));
	}

	#[tokio::test]
	async fn test_dir_of_event_keeps_directory() {
		let tmp = TempDir::new().unwrap();
		std::fs::create_dir(tmp.path().join("a")).unwrap();

		let abs = tmp.path().join("a");
		let dir = dir_of_event(tmp.path(), abs.to_str().unwrap()).await;
		assert_eq!(dir.as_deref(), Some("a"));
	}

	#[tokio::test]
	async fn test_dir_of_event_vanished_path() {
		let tmp = TempDir::new().unwrap();
		let abs = tmp.path().join("gone.txt");
		let dir = dir_of_event(tmp.path(), abs.to_str().unwrap()).await;
		assert_eq!(dir.as_deref(), Some("."));
	}

	#[tokio::test]
	async fn test_dir_of_event_root_event() {
		let tmp = TempDir::new().unwrap();
		let dir = dir_of_event(tmp.path(), tmp.path().to_str().unwrap()).await;
		assert_eq!(dir.as_deref(), Some("."));
	}
}

// vim: ts=4
