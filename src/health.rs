//! Liveness: periodic pings and the server-side silence watchdog.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::dispatch::DispatchHandle;
use crate::logging::*;
use crate::protocol::{Action, OutMsg};
use crate::repo::REPO_TMP;

/// Interval between PING broadcasts.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Wait before a client re-runs the bootstrap for a lost peer.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Marker file written just before a server-side silence abort, so the
/// supervisor can tell a hang from a crash.
pub const DEADLOCK_MARKER: &str = "deadlock";

/// Broadcast PING to every peer on a fixed interval, forever.
pub fn spawn_ping(dispatch: DispatchHandle) {
	tokio::spawn(async move {
		loop {
			dispatch.broadcast(OutMsg::new(Action::PING, Vec::new())).await;
			tokio::time::sleep(PING_INTERVAL).await;
		}
	});
}

/// Server-side watchdog: every received action resets the deadline. If
/// nothing arrives within twice the ping interval the process writes the
/// deadlock marker and exits non-zero so its supervisor restarts it.
pub fn spawn_watchdog(root: PathBuf, mut activity: mpsc::Receiver<()>) {
	tokio::spawn(async move {
		loop {
			match tokio::time::timeout(PING_INTERVAL * 2, activity.recv()).await {
				Ok(Some(())) => {}
				// Engine shut down; nothing left to watch.
				Ok(None) => return,
				Err(_) => {
					let marker = root.join(REPO_TMP).join(DEADLOCK_MARKER);
					let _ = std::fs::File::create(&marker);
					error!("Double ping interval exceeded: probably a deadlock");
					std::process::exit(1);
				}
			}
		}
	});
}

/// A cheap, non-blocking activity report for the watchdog.
pub fn report_activity(activity: &Option<mpsc::Sender<()>>) {
	if let Some(tx) = activity {
		let _ = tx.try_send(());
	}
}

// vim: ts=4
