//! Shell transport: bootstrapping a remote peer and opening the duplex
//! byte stream to it.
//!
//! The client prepares the remote side (state directory, binary upload,
//! initial bulk copy) and then launches the same binary there in
//! `--server` mode over ssh with piped stdin/stdout. Those two pipes are
//! the peer connection; everything above this module only sees a
//! [`PeerLink`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;

use crate::config::PeerSettings;
use crate::error::ConnectionError;
use crate::logging::*;
use crate::repo::SYNC_DIR;

const CONNECT_TIMEOUT: u32 = 10;
const SERVER_ALIVE_INTERVAL: u32 = 3;
const SERVER_ALIVE_COUNT_MAX: u32 = 4;

/// An established duplex byte stream to a peer.
pub struct PeerLink {
	pub writer: Box<dyn AsyncWrite + Send + Unpin>,
	pub reader: Box<dyn AsyncRead + Send + Unpin>,
	/// Keeps the subprocess alive; dropping it tears the peer down.
	pub child: Option<tokio::process::Child>,
}

/// Anything that can produce a peer connection. The ssh implementation is
/// the real one; tests inject loopback links.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn launch(&self, settings: &PeerSettings) -> Result<PeerLink, ConnectionError>;
}

/// The production transport: ssh/scp/rsync subprocesses.
pub struct SshTransport {
	/// Local tree being mirrored.
	pub source_dir: PathBuf,
	/// Directory containing the per-OS binaries to upload.
	pub binary_dir: PathBuf,
	/// Global excluded names, forwarded to the initial rsync.
	pub excludes: Vec<String>,
	/// Launch the remote side with debug logging.
	pub debug: bool,
}

impl SshTransport {
	fn ssh_options(settings: &PeerSettings) -> Vec<String> {
		let mut options = Vec::new();
		if settings.compression {
			options.extend(["-o".to_string(), "Compression=yes".to_string()]);
		}
		options.extend(["-o".to_string(), format!("ConnectTimeout={}", CONNECT_TIMEOUT)]);
		options
			.extend(["-o".to_string(), format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL)]);
		options
			.extend(["-o".to_string(), format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX)]);

		if let Some(port) = settings.port {
			options.extend(["-o".to_string(), format!("Port={}", port)]);
		}
		if let Some(user) = &settings.username {
			options.extend(["-o".to_string(), format!("User={}", user)]);
		}

		options
	}

	/// Run a bootstrap command to completion, failing on a non-zero exit.
	async fn run_checked(
		host: &str,
		cmd: &str,
		args: &[String],
	) -> Result<String, ConnectionError> {
		debug!("{} {}", cmd, args.join(" "));

		let output = Command::new(cmd)
			.args(args)
			.output()
			.await
			.map_err(|e| ConnectionError::SpawnFailed { cmd: cmd.to_string(), source: e })?;

		if !output.status.success() {
			return Err(ConnectionError::BootstrapFailed {
				host: host.to_string(),
				message: format!(
					"{} exited with {}: {}",
					cmd,
					output.status,
					String::from_utf8_lossy(&output.stderr).trim()
				),
			});
		}

		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}

	/// Pick the binary to upload: a per-OS build next to ours if present,
	/// otherwise the running binary itself.
	fn binary_for(&self, os: &str) -> PathBuf {
		let candidate = self.binary_dir.join(format!("sync-{}", os));
		if candidate.exists() {
			candidate
		} else {
			std::env::current_exe().unwrap_or_else(|_| self.binary_dir.join("sync"))
		}
	}
}

#[async_trait]
impl Transport for SshTransport {
	async fn launch(&self, settings: &PeerSettings) -> Result<PeerLink, ConnectionError> {
		let host = &settings.host;
		let remote_dir = format!("{}/{}", settings.dir, SYNC_DIR);
		let ssh_options = SshTransport::ssh_options(settings);

		info!("Creating directories at {}...", host);
		let mut args = ssh_options.clone();
		args.push(host.clone());
		args.push(format!(
			"if [ ! -d {dir} ]; then mkdir -p {dir}; fi; rm -f {dir}/sync && uname",
			dir = remote_dir
		));
		let uname = SshTransport::run_checked(host, "ssh", &args).await?.trim().to_lowercase();

		if uname != "darwin" && uname != "linux" {
			return Err(ConnectionError::UnsupportedOs { host: host.clone(), uname });
		}
		let os = settings.os.clone().unwrap_or(uname);

		info!("Copying sync binary to {}...", host);
		let mut args = ssh_options.clone();
		args.push(self.binary_for(&os).to_string_lossy().into_owned());
		args.push(format!("{}:{}/sync", host, remote_dir));
		SshTransport::run_checked(host, "scp", &args).await?;

		info!("Initial file sync using rsync at {}...", host);
		let mut args = vec!["-e".to_string(), format!("ssh {}", ssh_options.join(" "))];
		for mask in &self.excludes {
			args.push(format!("--exclude={}", mask));
		}
		for mask in &settings.excludes {
			args.push(format!("--exclude={}", mask));
		}
		args.push("-a".to_string());
		args.push("--delete".to_string());
		args.push(format!("{}/", self.source_dir.display()));
		args.push(format!("{}:{}/", host, settings.dir));
		SshTransport::run_checked(host, "rsync", &args).await?;

		info!("Launching sync at {}...", host);
		let mut flags = format!("--server --hostname={}", host);
		if self.debug {
			flags.push_str(" --debug");
		}
		if !settings.bidirectional {
			flags.push_str(" --no-watcher");
		}

		let mut args = ssh_options;
		args.push(host.clone());
		args.push(format!("{}/sync {} {}", remote_dir, flags, settings.dir));

		let mut child = Command::new("ssh")
			.args(&args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| ConnectionError::SpawnFailed { cmd: "ssh".to_string(), source: e })?;

		let writer = child
			.stdin
			.take()
			.ok_or(ConnectionError::StdioUnavailable { what: "stdin".to_string() })?;
		let stdout = child
			.stdout
			.take()
			.ok_or(ConnectionError::StdioUnavailable { what: "stdout".to_string() })?;

		Ok(PeerLink {
			writer: Box::new(writer),
			reader: Box::new(BufReader::new(stdout)),
			child: Some(child),
		})
	}
}


// vim: ts=4
