//! Wire protocol: action tags, message framing and length encoding.
//!
//! Every on-wire message starts with a fixed 10-byte ASCII action tag.
//! All actions except `PING`/`PONG` are followed by a 10-byte
//! right-aligned ASCII decimal payload length and exactly that many
//! payload bytes. A declared length above [`MAX_DIFF`] is a protocol
//! violation that terminates the offending peer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SyncError;

/// Upper bound for a single framed payload and for the diff staging buffer.
pub const MAX_DIFF: usize = 2 * 1024 * 1204;

/// Separator terminating every record inside a `DIFF` payload.
pub const DIFF_SEP: &str = "\n------------\n";

/// Opaque per-peer identity handed out by the dispatcher. Used for echo
/// suppression and as the replay key in the out-log; never dereferenced.
pub type StreamId = u64;

/// A fixed-width 10-byte action tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Action(pub [u8; 10]);

impl Action {
	pub const PING: Action = Action(*b"PING      ");
	pub const PONG: Action = Action(*b"PONG      ");
	pub const DIFF: Action = Action(*b"DIFF      ");
	pub const BIG_INIT: Action = Action(*b"BIGINIT   ");
	pub const BIG_RCV: Action = Action(*b"BIGRCV    ");
	pub const BIG_COMMIT: Action = Action(*b"BIGCOMMIT ");
	pub const BIG_ABORT: Action = Action(*b"BIGABORT  ");

	// Internal actions; these never cross the wire.
	pub const ADD_STREAM: Action = Action(*b"ADDSTREAM ");
	pub const DEL_STREAM: Action = Action(*b"DELSTREAM ");
	pub const STOP: Action = Action(*b"STOP      ");

	const WIRE: [Action; 7] = [
		Action::PING,
		Action::PONG,
		Action::DIFF,
		Action::BIG_INIT,
		Action::BIG_RCV,
		Action::BIG_COMMIT,
		Action::BIG_ABORT,
	];

	/// Accept a tag read off the wire; unknown tags are rejected.
	pub fn from_wire(raw: [u8; 10]) -> Option<Action> {
		let action = Action(raw);
		Action::WIRE.contains(&action).then_some(action)
	}

	pub fn as_bytes(&self) -> &[u8; 10] {
		&self.0
	}

	/// Tag without the space padding, for log output.
	pub fn name(&self) -> &str {
		std::str::from_utf8(&self.0).unwrap_or("?").trim_end()
	}

	/// PING and PONG carry no length word and no payload.
	pub fn has_payload(&self) -> bool {
		*self != Action::PING && *self != Action::PONG
	}
}

impl std::fmt::Debug for Action {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name())
	}
}

/// The unit the dispatcher broadcasts: an action, its payload and the
/// peer it originated from (`None` for locally produced messages).
#[derive(Debug, Clone)]
pub struct OutMsg {
	pub action: Action,
	pub payload: Vec<u8>,
	pub origin: Option<StreamId>,
}

impl OutMsg {
	pub fn new(action: Action, payload: Vec<u8>) -> OutMsg {
		OutMsg { action, payload, origin: None }
	}

	pub fn from_peer(action: Action, payload: Vec<u8>, origin: StreamId) -> OutMsg {
		OutMsg { action, payload, origin: Some(origin) }
	}
}

/// Encode a length as 10 right-aligned ASCII decimal bytes.
pub fn len10(n: usize) -> [u8; 10] {
	let mut out = [b' '; 10];
	let s = n.to_string();
	out[10 - s.len()..].copy_from_slice(s.as_bytes());
	out
}

/// Decode a 10-byte length word.
pub fn parse_len10(raw: &[u8]) -> Result<usize, SyncError> {
	let s = std::str::from_utf8(raw)
		.map_err(|_| SyncError::protocol("length word is not ASCII"))?;
	s.trim()
		.parse()
		.map_err(|_| SyncError::protocol(format!("bad length word '{}'", s.trim())))
}

/// Read one framed message: tag, then (except for PING/PONG) a length
/// word and payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Action, Vec<u8>), SyncError>
where
	R: AsyncRead + Unpin,
{
	let mut tag = [0u8; 10];
	reader.read_exact(&mut tag).await?;

	let action = Action::from_wire(tag).ok_or_else(|| {
		SyncError::protocol(format!("unknown action tag {:?}", String::from_utf8_lossy(&tag)))
	})?;

	if !action.has_payload() {
		return Ok((action, Vec::new()));
	}

	let mut len_word = [0u8; 10];
	reader.read_exact(&mut len_word).await?;
	let length = parse_len10(&len_word)?;

	if length > MAX_DIFF {
		return Err(SyncError::protocol(format!(
			"declared payload of {} bytes exceeds the {} limit",
			length, MAX_DIFF
		)));
	}

	let mut payload = vec![0u8; length];
	if length > 0 {
		reader.read_exact(&mut payload).await?;
	}

	Ok((action, payload))
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, action: Action, payload: &[u8]) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	writer.write_all(action.as_bytes()).await?;
	if action.has_payload() {
		writer.write_all(&len10(payload.len())).await?;
		writer.write_all(payload).await?;
	}
	writer.flush().await
}


// vim: ts=4
