//! Fan-out dispatcher: broadcasts outbound messages to every connected
//! peer except the one they originated from.
//!
//! A single task owns the peer list. Everything else talks to it through
//! commands on a bounded channel, so no lock is ever held across a write
//! to a peer. Each peer gets its own sender task with a bounded queue;
//! messages are written strictly in the order they were enqueued, and a
//! write failure removes only that peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::logging::*;
use crate::outlog::OutLog;
use crate::protocol::{write_frame, Action, OutMsg, StreamId};

/// Depth of each per-peer send queue.
const PEER_QUEUE_DEPTH: usize = 100;

pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Cmd {
	/// Register a peer's write side and start its sender task.
	Add { id: StreamId, writer: PeerWriter },
	/// Drop a peer; `send_stop` also terminates its sender task.
	Del { id: StreamId, send_stop: bool },
	/// Deliver to exactly one peer (PONG replies).
	Direct { id: StreamId, msg: OutMsg },
	/// Deliver to every peer except the origin.
	Broadcast(OutMsg),
}

struct PeerEntry {
	id: StreamId,
	queue: mpsc::Sender<OutMsg>,
}

/// Handle for talking to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
	tx: mpsc::Sender<Cmd>,
	next_id: Arc<AtomicU64>,
}

impl DispatchHandle {
	/// Allocate a stream id for a new peer. Ids are never reused, so a
	/// reconnected peer gets a fresh identity.
	pub fn next_id(&self) -> StreamId {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	pub async fn add_peer(&self, id: StreamId, writer: PeerWriter) {
		let _ = self.tx.send(Cmd::Add { id, writer }).await;
	}

	pub async fn del_peer(&self, id: StreamId, send_stop: bool) {
		let _ = self.tx.send(Cmd::Del { id, send_stop }).await;
	}

	pub async fn direct(&self, id: StreamId, msg: OutMsg) {
		let _ = self.tx.send(Cmd::Direct { id, msg }).await;
	}

	pub async fn broadcast(&self, msg: OutMsg) {
		let _ = self.tx.send(Cmd::Broadcast(msg)).await;
	}
}

/// Start the dispatcher task. When `outlog` is set, every broadcast wire
/// message is journaled with its origin id as the replay key.
pub fn spawn(outlog: Option<Arc<OutLog>>) -> DispatchHandle {
	let (tx, rx) = mpsc::channel(64);
	let handle = DispatchHandle { tx, next_id: Arc::new(AtomicU64::new(1)) };
	tokio::spawn(dispatcher_loop(rx, handle.clone(), outlog));
	handle
}

async fn dispatcher_loop(
	mut rx: mpsc::Receiver<Cmd>,
	handle: DispatchHandle,
	outlog: Option<Arc<OutLog>>,
) {
	let mut peers: Vec<PeerEntry> = Vec::new();

	while let Some(cmd) = rx.recv().await {
		match cmd {
			Cmd::Add { id, writer } => {
				let (queue_tx, queue_rx) = mpsc::channel(PEER_QUEUE_DEPTH);
				tokio::spawn(peer_sender(id, writer, queue_rx, handle.clone()));
				peers.push(PeerEntry { id, queue: queue_tx });
				debug!("Registered send stream {}", id);
			}
			Cmd::Del { id, send_stop } => {
				if let Some(pos) = peers.iter().position(|p| p.id == id) {
					let entry = peers.remove(pos);
					if send_stop {
						let _ = entry.queue.send(OutMsg::new(Action::STOP, Vec::new())).await;
					}
					debug!("Removed send stream {}", id);
				}
			}
			Cmd::Direct { id, msg } => {
				if let Some(entry) = peers.iter().find(|p| p.id == id) {
					let _ = entry.queue.send(msg).await;
				}
			}
			Cmd::Broadcast(msg) => {
				if let Some(log) = &outlog {
					if let Err(e) = log.append(msg.action, &msg.payload, msg.origin).await {
						warn!("Cannot append to out-log: {}", e);
					}
				}
				for entry in &peers {
					let _ = entry.queue.send(msg.clone()).await;
				}
			}
		}
	}
}

/// Per-peer sender: drains the queue in order, suppressing messages that
/// originated from this very peer. Terminates on STOP or a write error;
/// dropping the writer closes the stream.
async fn peer_sender(
	id: StreamId,
	mut writer: PeerWriter,
	mut queue: mpsc::Receiver<OutMsg>,
	handle: DispatchHandle,
) {
	while let Some(msg) = queue.recv().await {
		if msg.action == Action::STOP {
			break;
		}
		if msg.origin == Some(id) {
			continue;
		}
		if let Err(e) = write_frame(&mut writer, msg.action, &msg.payload).await {
			warn!("Cannot write {} to stream {}: {}", msg.action.name(), id, e);
			handle.del_peer(id, false).await;
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::read_frame;
	use tokio::io::duplex;
	use tokio::time::{timeout, Duration};

	async fn next_frame(
		reader: &mut (impl tokio::io::AsyncRead + Unpin),
	) -> (Action, Vec<u8>) {
		timeout(Duration::from_secs(2), read_frame(reader)).await.unwrap().unwrap()
	}

	#[tokio::test]
	async fn test_broadcast_reaches_all_peers() {
		let handle = spawn(None);

		let (w1, mut r1) = duplex(64 * 1024);
		let (w2, mut r2) = duplex(64 * 1024);
		let id1 = handle.next_id();
		let id2 = handle.next_id();
		handle.add_peer(id1, Box::new(w1)).await;
		handle.add_peer(id2, Box::new(w2)).await;

		handle.broadcast(OutMsg::new(Action::DIFF, b"payload".to_vec())).await;

		let (action, payload) = next_frame(&mut r1).await;
		assert_eq!(action, Action::DIFF);
		assert_eq!(payload, b"payload");
		let (action, payload) = next_frame(&mut r2).await;
		assert_eq!(action, Action::DIFF);
		assert_eq!(payload, b"payload");
	}

	#[tokio::test]
	async fn test_echo_suppression() {
		let handle = spawn(None);

		let (w1, mut r1) = duplex(64 * 1024);
		let (w2, mut r2) = duplex(64 * 1024);
		let id1 = handle.next_id();
		let id2 = handle.next_id();
		handle.add_peer(id1, Box::new(w1)).await;
		handle.add_peer(id2, Box::new(w2)).await;

		// A message from peer 1 must reach only peer 2.
		handle.broadcast(OutMsg::from_peer(Action::DIFF, b"from-1".to_vec(), id1)).await;
		// A follow-up marker proves nothing arrived at peer 1 in between.
		handle.broadcast(OutMsg::new(Action::PING, Vec::new())).await;

		let (action, _) = next_frame(&mut r1).await;
		assert_eq!(action, Action::PING);

		let (action, payload) = next_frame(&mut r2).await;
		assert_eq!(action, Action::DIFF);
		assert_eq!(payload, b"from-1");
	}

	#[tokio::test]
	async fn test_direct_targets_single_peer() {
		let handle = spawn(None);

		let (w1, mut r1) = duplex(64 * 1024);
		let (w2, mut r2) = duplex(64 * 1024);
		let id1 = handle.next_id();
		let id2 = handle.next_id();
		handle.add_peer(id1, Box::new(w1)).await;
		handle.add_peer(id2, Box::new(w2)).await;

		handle.direct(id1, OutMsg::new(Action::PONG, Vec::new())).await;
		handle.broadcast(OutMsg::new(Action::PING, Vec::new())).await;

		let (action, _) = next_frame(&mut r1).await;
		assert_eq!(action, Action::PONG);
		// Peer 2 sees only the broadcast.
		let (action, _) = next_frame(&mut r2).await;
		assert_eq!(action, Action::PING);
	}

	#[tokio::test]
	async fn test_del_with_stop_closes_stream() {
		let handle = spawn(None);

		let (w, mut r) = duplex(64 * 1024);
		let id = handle.next_id();
		handle.add_peer(id, Box::new(w)).await;
		handle.del_peer(id, true).await;

		// Sender task exits, dropping the writer; the read side sees EOF.
		let res = timeout(Duration::from_secs(2), read_frame(&mut r)).await.unwrap();
		assert!(res.is_err());

		// Later broadcasts no longer reach the removed peer.
		handle.broadcast(OutMsg::new(Action::PING, Vec::new())).await;
	}

	#[tokio::test]
	async fn test_per_peer_ordering() {
		let handle = spawn(None);

		let (w, mut r) = duplex(1024 * 1024);
		let id = handle.next_id();
		handle.add_peer(id, Box::new(w)).await;

		for i in 0..20u8 {
			handle.broadcast(OutMsg::new(Action::DIFF, vec![i])).await;
		}
		for i in 0..20u8 {
			let (_, payload) = next_frame(&mut r).await;
			assert_eq!(payload, vec![i]);
		}
	}

	#[tokio::test]
	async fn test_broadcast_journaled_with_origin_key() {
		use tempfile::TempDir;

		let tmp = TempDir::new().unwrap();
		let log = Arc::new(OutLog::create(tmp.path().join("out.log")).await.unwrap());
		let handle = spawn(Some(Arc::clone(&log)));

		handle.broadcast(OutMsg::from_peer(Action::DIFF, b"x".to_vec(), 9)).await;

		let mut tail = Arc::clone(&log).tail(0, Some(9)).await.unwrap();
		// The only record carries key 9, so a skip-9 tail stays blocked.
		assert!(timeout(Duration::from_millis(80), tail.next()).await.is_err());

		let mut tail = Arc::clone(&log).tail(0, None).await.unwrap();
		let (action, payload) =
			timeout(Duration::from_secs(2), tail.next()).await.unwrap().unwrap();
		assert_eq!(action, Action::DIFF);
		assert_eq!(payload, b"x");
	}
}

// vim: ts=4
