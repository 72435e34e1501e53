//! Append-only journal of outbound framed messages.
//!
//! Every wire message the dispatcher broadcasts is also appended here,
//! so a peer that subscribes mid-stream can be backfilled by byte offset
//! instead of forcing a full re-copy. Records carry an opaque per-peer
//! key (the origin stream id) so replay can skip a peer's own messages.
//!
//! Record layout: `len10(key) key tag len10(payload) payload`, where the
//! key is the decimal stream id or empty for locally produced messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::protocol::{len10, parse_len10, Action, StreamId, MAX_DIFF};

/// Sleep while the tail is caught up with the writer.
const CAUGHT_UP_WAIT: Duration = Duration::from_millis(20);
/// Sleep after a short read in the middle of a record.
const SHORT_READ_WAIT: Duration = Duration::from_millis(100);

struct OutLogInner {
	file: fs::File,
	position: u64,
}

/// The journal writer. Appends are serialized by the internal mutex.
pub struct OutLog {
	path: PathBuf,
	inner: Mutex<OutLogInner>,
}

impl OutLog {
	/// Create (truncating) the journal at `path`.
	pub async fn create(path: impl Into<PathBuf>) -> Result<OutLog, SyncError> {
		let path = path.into();
		let file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)
			.await?;
		Ok(OutLog { path, inner: Mutex::new(OutLogInner { file, position: 0 }) })
	}

	/// Append one record; returns the journal position after the write.
	pub async fn append(
		&self,
		action: Action,
		payload: &[u8],
		key: Option<StreamId>,
	) -> Result<u64, SyncError> {
		let key_str = key.map(|k| k.to_string()).unwrap_or_default();

		let mut inner = self.inner.lock().await;
		inner.file.write_all(&len10(key_str.len())).await?;
		inner.file.write_all(key_str.as_bytes()).await?;
		inner.file.write_all(action.as_bytes()).await?;
		inner.file.write_all(&len10(payload.len())).await?;
		inner.file.write_all(payload).await?;
		inner.file.flush().await?;

		inner.position += (10 + key_str.len() + 10 + 10 + payload.len()) as u64;
		Ok(inner.position)
	}

	/// Current end-of-journal position.
	pub async fn position(&self) -> u64 {
		self.inner.lock().await.position
	}

	/// Open a tailing cursor at `start`, skipping records whose key equals
	/// `skip_key`.
	pub async fn tail(
		self: Arc<Self>,
		start: u64,
		skip_key: Option<StreamId>,
	) -> Result<OutLogTail, SyncError> {
		let mut file = fs::File::open(&self.path).await?;
		use tokio::io::AsyncSeekExt;
		file.seek(std::io::SeekFrom::Start(start)).await?;
		Ok(OutLogTail { log: self, file, skip_key })
	}
}

/// A blocking cursor over the journal. `next` waits for more data when it
/// reaches the live end.
pub struct OutLogTail {
	log: Arc<OutLog>,
	file: fs::File,
	skip_key: Option<StreamId>,
}

impl OutLogTail {
	/// Read exactly `buf.len()` bytes, waiting for the writer when the
	/// journal ends mid-way. At a record boundary the wait is short; in
	/// the middle of a record it backs off harder, since the writer is
	/// mid-append.
	async fn read_exact_waiting(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<(), SyncError> {
		let mut filled = 0;
		while filled < buf.len() {
			let n = self.file.read(&mut buf[filled..]).await?;
			if n == 0 {
				let wait = if filled == 0 && at_boundary { CAUGHT_UP_WAIT } else { SHORT_READ_WAIT };
				tokio::time::sleep(wait).await;
			} else {
				filled += n;
			}
		}
		Ok(())
	}

	/// Yield the next record not filtered by the skip key. Waits when
	/// caught up with the writer.
	pub async fn next(&mut self) -> Result<(Action, Vec<u8>), SyncError> {
		loop {
			let mut word = [0u8; 10];
			self.read_exact_waiting(&mut word, true).await?;
			let key_len = parse_len10(&word)
				.map_err(|_| SyncError::corrupt(format!("bad key length in {}", self.log.path.display())))?;

			let mut key = vec![0u8; key_len];
			self.read_exact_waiting(&mut key, false).await?;

			let mut tag = [0u8; 10];
			self.read_exact_waiting(&mut tag, false).await?;
			let action = Action::from_wire(tag).ok_or_else(|| {
				SyncError::corrupt(format!("unknown action in {}", self.log.path.display()))
			})?;

			self.read_exact_waiting(&mut word, false).await?;
			let payload_len = parse_len10(&word)
				.map_err(|_| SyncError::corrupt(format!("bad payload length in {}", self.log.path.display())))?;
			if payload_len > MAX_DIFF {
				return Err(SyncError::corrupt(format!(
					"oversized record in {}",
					self.log.path.display()
				)));
			}

			let mut payload = vec![0u8; payload_len];
			self.read_exact_waiting(&mut payload, false).await?;

			if let Some(skip) = self.skip_key {
				let key_str = String::from_utf8_lossy(&key);
				if !key_str.is_empty() && key_str.parse::<StreamId>() == Ok(skip) {
					continue;
				}
			}

			return Ok((action, payload));
		}
	}
}


// vim: ts=4
