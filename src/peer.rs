//! The per-peer apply side and the client-side connection lifecycle.
//!
//! An applier reads framed messages off one peer's stream and applies
//! them to the local tree. Errors are terminal for that peer only: the
//! client tears the connection down and re-runs the bootstrap after a
//! delay, while the server role exits and leaves the restart to the
//! client that launched it. Fatal/corruption errors abort the process on
//! either side.

use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::apply::{apply_diff, ApplyMode, BigFileTable};
use crate::config::PeerSettings;
use crate::dispatch::DispatchHandle;
use crate::engine::{Engine, Role};
use crate::error::SyncError;
use crate::health::{report_activity, RETRY_INTERVAL};
use crate::logging::*;
use crate::protocol::{read_frame, Action, OutMsg, StreamId};
use crate::transport::Transport;

/// Connection lifecycle of a client-managed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
	Connecting,
	Bootstrapping,
	Running,
	Closing,
	Reconnecting,
}

fn enter(state: &mut PeerState, next: PeerState, host: &str) {
	debug!("Peer {}: {:?} -> {:?}", host, state, next);
	*state = next;
}

/// Read and apply messages from one peer until the stream errors out.
///
/// In the client role every applied message is re-broadcast through the
/// dispatcher with this peer as origin, so other peers converge too; the
/// origin key keeps it from echoing back. Unfinished big-file transfers
/// are discarded when the loop ends, however it ends.
pub async fn apply_loop(
	engine: Arc<Engine>,
	mut reader: Box<dyn AsyncRead + Send + Unpin>,
	id: StreamId,
	peer_name: String,
	activity: Option<mpsc::Sender<()>>,
) -> Result<(), SyncError> {
	let mut bigs = BigFileTable::new(engine.root.clone());
	let result =
		apply_actions(&engine, &mut reader, id, &peer_name, &activity, &mut bigs).await;
	bigs.cleanup().await;
	result
}

async fn apply_actions(
	engine: &Engine,
	reader: &mut Box<dyn AsyncRead + Send + Unpin>,
	id: StreamId,
	peer_name: &str,
	activity: &Option<mpsc::Sender<()>>,
	bigs: &mut BigFileTable,
) -> Result<(), SyncError> {
	loop {
		let (action, payload) = read_frame(reader).await?;
		report_activity(activity);
		debug!("Received {} from {}", action.name(), peer_name);

		match action {
			Action::PING => {
				engine.dispatch.direct(id, OutMsg::new(Action::PONG, Vec::new())).await;
				continue;
			}
			Action::PONG => {
				debug!("{} reported that it is alive", peer_name);
				continue;
			}
			Action::DIFF => {
				let _guard = engine.repo.acquire().await;
				apply_diff(&engine.repo, &payload, ApplyMode::Full).await?;
			}
			Action::BIG_INIT => bigs.init(&payload).await?,
			Action::BIG_RCV => bigs.receive(&payload).await?,
			Action::BIG_COMMIT => {
				let _guard = engine.repo.acquire().await;
				bigs.commit(&engine.repo, &payload).await?;
			}
			Action::BIG_ABORT => bigs.abort(&payload).await?,
			other => {
				return Err(SyncError::protocol(format!(
					"unexpected action {} from {}",
					other.name(),
					peer_name
				)));
			}
		}

		// Fan the change out to the other peers; the server role has only
		// the one stream it came from.
		if engine.role == Role::Client {
			engine.dispatch.broadcast(OutMsg::from_peer(action, payload, id)).await;
		}
	}
}

/// Drive one configured peer forever: bootstrap, run, tear down,
/// reconnect. Never returns; fatal errors abort the process.
pub fn spawn_client_peer(
	engine: Arc<Engine>,
	settings: PeerSettings,
	transport: Arc<dyn Transport>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let host = settings.host.clone();
		let mut state = PeerState::Connecting;

		loop {
			enter(&mut state, PeerState::Bootstrapping, &host);
			let link = match transport.launch(&settings).await {
				Ok(link) => link,
				Err(e) => {
					warn!("Failed to start for server {}: {}", host, e);
					enter(&mut state, PeerState::Reconnecting, &host);
					tokio::time::sleep(RETRY_INTERVAL).await;
					info!("Reconnecting to {}", host);
					enter(&mut state, PeerState::Connecting, &host);
					continue;
				}
			};

			let id = engine.dispatch.next_id();
			engine.dispatch.add_peer(id, link.writer).await;
			// Probe the fresh stream right away instead of waiting a full
			// ping interval.
			engine.dispatch.direct(id, OutMsg::new(Action::PING, Vec::new())).await;

			enter(&mut state, PeerState::Running, &host);
			let result =
				apply_loop(engine.clone(), link.reader, id, host.clone(), None).await;

			enter(&mut state, PeerState::Closing, &host);
			if let Err(e) = result {
				if e.is_fatal() {
					error!("Unrecoverable error from {}: {}", host, e);
					std::process::exit(1);
				}
				warn!("Error from {}: {}", host, e);
			}
			info!("Lost connection to {}", host);

			engine.dispatch.del_peer(id, true).await;
			drop(link.child);

			enter(&mut state, PeerState::Reconnecting, &host);
			tokio::time::sleep(RETRY_INTERVAL).await;
			info!("Reconnecting to {}", host);
			enter(&mut state, PeerState::Connecting, &host);
		}
	})
}

/// Register a raw duplex stream as a peer and run its applier to
/// completion, deregistering the send side if the applier fails. Useful
/// for loopback links where no bootstrap is involved.
pub async fn run_stream_peer(
	engine: Arc<Engine>,
	dispatch: DispatchHandle,
	writer: crate::dispatch::PeerWriter,
	reader: Box<dyn AsyncRead + Send + Unpin>,
	peer_name: String,
	activity: Option<mpsc::Sender<()>>,
) -> Result<(), SyncError> {
	let id = dispatch.next_id();
	dispatch.add_peer(id, writer).await;
	let result = apply_loop(engine, reader, id, peer_name, activity).await;
	if result.is_err() {
		dispatch.del_peer(id, true).await;
	}
	result
}

// vim: ts=4
