//! Outbound change staging: the diff buffer and the big-file send path.
//!
//! Scanned changes accumulate as records in a fixed-capacity buffer that
//! becomes a single `DIFF` message when flushed. Entries whose payload
//! exceeds half the buffer go out-of-band as a chunked big-file transfer
//! so one huge file never stalls the stream of small changes.
//!
//! The flush hand-off is the one place the repository lock is released
//! mid-batch: the buffer is handed to the dispatcher without the lock
//! (senders must never block scanning), then the lock is re-acquired and
//! the same diff is folded into the metadata store. The store therefore
//! only advances once a diff has actually been emitted.

use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::OwnedMutexGuard;

use crate::apply::{apply_diff, ApplyMode};
use crate::dispatch::DispatchHandle;
use crate::error::SyncError;
use crate::logging::*;
use crate::protocol::{len10, Action, OutMsg, DIFF_SEP, MAX_DIFF};
use crate::repo::Repo;
use crate::types::EntryStat;

/// Staging buffer plus everything needed to emit it.
pub struct DiffSender {
	repo: Repo,
	dispatch: DispatchHandle,
	buf: Vec<u8>,
	guard: Option<OwnedMutexGuard<()>>,
}

impl DiffSender {
	pub fn new(repo: Repo, dispatch: DispatchHandle) -> DiffSender {
		DiffSender { repo, dispatch, buf: Vec::new(), guard: None }
	}

	/// Enter a batch: the repository lock guard is parked here so the
	/// flush path can release and re-acquire it.
	pub fn begin(&mut self, guard: OwnedMutexGuard<()>) {
		self.guard = Some(guard);
	}

	/// Leave the batch, releasing the lock.
	pub fn end(&mut self) {
		self.guard = None;
	}

	/// Stage one record. `None` stat is a deletion. Oversized payloads are
	/// diverted to the big-file channel; a full buffer is flushed first.
	pub async fn add_entry(
		&mut self,
		path: &str,
		stat: Option<&EntryStat>,
	) -> Result<(), SyncError> {
		let header = match stat {
			None => format!("D {}{}", path, DIFF_SEP),
			Some(stat) => format!("A {}\n{}{}", path, stat.serialize(), DIFF_SEP),
		};

		let payload_len = match stat {
			Some(stat) if !stat.is_dir => stat.size as usize,
			_ => 0,
		};

		if let Some(stat) = stat {
			if !stat.is_dir && stat.size as usize > MAX_DIFF / 2 {
				return self.send_big_file(path, stat).await;
			}
		}

		if self.buf.len() + header.len() + payload_len >= MAX_DIFF - 1 {
			self.flush().await?;
		}

		let data = match stat {
			Some(stat) if payload_len > 0 => {
				match self.read_payload(path, stat, payload_len).await? {
					Some(data) => data,
					// Entry changed under us; the next event retries it.
					None => return Ok(()),
				}
			}
			_ => Vec::new(),
		};

		self.buf.extend_from_slice(header.as_bytes());
		self.buf.extend_from_slice(&data);
		Ok(())
	}

	/// Read the record payload: the link target for symlinks, the file
	/// contents otherwise. Returns `None` when the on-disk length no
	/// longer matches the declared size.
	async fn read_payload(
		&self,
		path: &str,
		stat: &EntryStat,
		expected: usize,
	) -> Result<Option<Vec<u8>>, SyncError> {
		let abs = self.repo.root().join(path);

		if stat.is_symlink {
			let target = match tokio::fs::read_link(&abs).await {
				Ok(t) => t,
				Err(e) => {
					warn!("Could not read link {}: {}", path, e);
					return Ok(None);
				}
			};
			let bytes = target.to_string_lossy().into_owned().into_bytes();
			if bytes.len() != expected {
				debug!("Link target length changed for {}", path);
				return Ok(None);
			}
			return Ok(Some(bytes));
		}

		let mut file = match tokio::fs::File::open(&abs).await {
			Ok(f) => f,
			Err(e) => {
				warn!("Could not open {}: {}", path, e);
				return Ok(None);
			}
		};

		let mut data = Vec::with_capacity(expected);
		file.read_to_end(&mut data)
			.await
			.map_err(|e| SyncError::fatal(format!("cannot read {}: {}", path, e)))?;

		if data.len() != expected {
			debug!("Read different number of bytes than expected from {}", path);
			return Ok(None);
		}

		Ok(Some(data))
	}

	/// Emit the staged records as one `DIFF` message, then advance the
	/// metadata store to match.
	pub async fn flush(&mut self) -> Result<(), SyncError> {
		if self.buf.is_empty() {
			return Ok(());
		}

		let payload = std::mem::take(&mut self.buf);
		debug!("Flushing diff, length {}", payload.len());

		let released = self.guard.take();
		drop(released);

		self.dispatch.broadcast(OutMsg::new(Action::DIFF, payload.clone())).await;

		self.guard = Some(self.repo.acquire().await);
		apply_diff(&self.repo, &payload, ApplyMode::RepoOnly).await
	}

	/// Stream one oversized entry: init, chunks, then commit or abort.
	///
	/// The metadata entry is recorded up front, while the lock is still
	/// held, so a scan that runs during the transfer does not queue the
	/// same file again. The transfer itself runs without the lock.
	async fn send_big_file(&mut self, path: &str, stat: &EntryStat) -> Result<(), SyncError> {
		info!("Sending big file: {} ({} MiB)", path, stat.size / 1024 / 1024);

		let abs = self.repo.root().join(path);
		let mut file = match tokio::fs::File::open(&abs).await {
			Ok(f) => f,
			Err(e) => {
				warn!("Could not open {}: {}", path, e);
				return Ok(());
			}
		};

		self.repo.commit_single(Path::new(path), Some(*stat)).await?;

		let released = self.guard.take();
		drop(released);

		let result = self.stream_chunks(&mut file, path, stat).await;

		self.guard = Some(self.repo.acquire().await);
		result
	}

	async fn stream_chunks(
		&mut self,
		file: &mut tokio::fs::File,
		path: &str,
		stat: &EntryStat,
	) -> Result<(), SyncError> {
		self.dispatch
			.broadcast(OutMsg::new(Action::BIG_INIT, path.as_bytes().to_vec()))
			.await;

		let chunk_cap = MAX_DIFF / 2 - 10 - path.len();
		let mut bytes_left = stat.size;

		loop {
			// The source may change while we stream it; verify before
			// every chunk and abort rather than ship a torn file.
			let meta = match file.metadata().await {
				Ok(m) => m,
				Err(e) => {
					self.send_abort(path).await;
					return Err(SyncError::fatal(format!(
						"cannot stat {} that we are reading right now: {}",
						path, e
					)));
				}
			};
			if !EntryStat::from_metadata(&meta).stats_equal(stat) {
				info!("File {} has changed, aborting transfer", path);
				self.send_abort(path).await;
				return Ok(());
			}

			let mut data = vec![0u8; chunk_cap];
			let n = match file.read(&mut data).await {
				Ok(n) => n,
				Err(e) => {
					self.send_abort(path).await;
					return Err(SyncError::fatal(format!("cannot read {}: {}", path, e)));
				}
			};

			if n != chunk_cap && n as u64 != bytes_left {
				warn!("Read different number of bytes than expected from {}", path);
				self.send_abort(path).await;
				return Ok(());
			}

			let mut payload = Vec::with_capacity(10 + path.len() + n);
			payload.extend_from_slice(&len10(path.len()));
			payload.extend_from_slice(path.as_bytes());
			payload.extend_from_slice(&data[..n]);
			self.dispatch.broadcast(OutMsg::new(Action::BIG_RCV, payload)).await;

			bytes_left -= n as u64;
			if bytes_left == 0 {
				break;
			}
		}

		let mut payload = Vec::with_capacity(10 + path.len() + 64);
		payload.extend_from_slice(&len10(path.len()));
		payload.extend_from_slice(path.as_bytes());
		payload.extend_from_slice(stat.serialize().as_bytes());
		self.dispatch.broadcast(OutMsg::new(Action::BIG_COMMIT, payload)).await;

		info!("Big file {} successfully sent", path);
		Ok(())
	}

	async fn send_abort(&self, path: &str) {
		self.dispatch
			.broadcast(OutMsg::new(Action::BIG_ABORT, path.as_bytes().to_vec()))
			.await;
	}
}


// vim: ts=4
