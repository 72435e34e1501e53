//! Client configuration: one INI file with a defaults section and one
//! section per peer.
//!
//! The `general_settings` section provides defaults that are merged into
//! every peer section; a peer value always wins over a general one. The
//! internal `.sync` directory is excluded unconditionally.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use ini::Ini;

use crate::error::SyncError;
use crate::logging::*;

pub const GENERAL_SECTION: &str = "general_settings";

/// Settings for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerSettings {
	/// Section name; doubles as the host when no `host` key is given.
	pub name: String,
	pub host: String,
	pub port: Option<u16>,
	pub username: Option<String>,
	/// Directory to mirror into on the remote side.
	pub dir: String,
	/// Remote OS override; probed via `uname` when absent.
	pub os: Option<String>,
	/// Per-peer excluded names, merged on top of the global set.
	pub excludes: HashSet<String>,
	/// Whether the remote side also watches and emits its own changes.
	pub bidirectional: bool,
	/// ssh compression.
	pub compression: bool,
}

/// The parsed client configuration.
#[derive(Debug, Clone)]
pub struct Config {
	/// Globally excluded names, `.sync` always included.
	pub excludes: HashSet<String>,
	pub peers: Vec<PeerSettings>,
}

/// Split a pipe-separated exclude list.
pub fn parse_excludes(raw: &str) -> HashSet<String> {
	raw.split('|').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
	match raw {
		Some(v) => v.eq_ignore_ascii_case("true"),
		None => default,
	}
}

fn parse_peer(
	name: &str,
	values: &HashMap<String, String>,
) -> Result<PeerSettings, SyncError> {
	let port = match values.get("port") {
		Some(raw) => Some(raw.parse::<u16>().map_err(|e| {
			SyncError::config(format!("cannot parse 'port' in [{}]: {}", name, e))
		})?),
		None => None,
	};

	let dir = values
		.get("dir")
		.cloned()
		.ok_or_else(|| SyncError::config(format!("missing 'dir' in [{}]", name)))?;

	let excludes = values.get("exclude").map(|raw| parse_excludes(raw)).unwrap_or_default();

	Ok(PeerSettings {
		name: name.to_string(),
		host: values.get("host").cloned().unwrap_or_else(|| name.to_string()),
		port,
		username: values.get("username").cloned(),
		dir,
		os: values.get("os").cloned(),
		excludes,
		bidirectional: parse_bool(values.get("bidirectional").map(String::as_str), false),
		// On by default; only an explicit "false" turns it off.
		compression: values.get("compression").map(String::as_str) != Some("false"),
	})
}

/// Load and validate the client configuration file.
pub fn load(path: &Path) -> Result<Config, SyncError> {
	let ini = Ini::load_from_file(path)
		.map_err(|e| SyncError::config(format!("cannot load {}: {}", path.display(), e)))?;

	let general: HashMap<String, String> = match ini.section(Some(GENERAL_SECTION)) {
		Some(props) => props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
		None => {
			return Err(SyncError::config(format!(
				"section {} of {} is empty",
				GENERAL_SECTION,
				path.display()
			)))
		}
	};

	let mut excludes = general.get("exclude").map(|raw| parse_excludes(raw)).unwrap_or_default();
	excludes.insert(".sync".to_string());

	let mut peers = Vec::new();
	for (section, props) in ini.iter() {
		let name = match section {
			Some(name) if name != GENERAL_SECTION => name,
			_ => continue,
		};

		if props.contains_key("disabled") {
			info!("Skipping [{}] as disabled", name);
			continue;
		}

		let mut values: HashMap<String, String> =
			props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		for (key, value) in &general {
			values.entry(key.clone()).or_insert_with(|| value.clone());
		}

		peers.push(parse_peer(name, &values)?);
	}

	Ok(Config { excludes, peers })
}


// vim: ts=4
