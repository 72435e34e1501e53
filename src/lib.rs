//! # treesync - Continuous Directory Mirroring
//!
//! treesync keeps a local directory tree mirrored to one or more remote
//! machines, continuously. A watcher reports changed paths, a scanner
//! diffs them against a per-directory metadata store, and the resulting
//! change batches stream over ssh-piped stdin/stdout to remote peers
//! running the same binary in server mode. Bidirectional peers emit
//! their own changes back over the same stream.
//!
//! ## Quick start
//!
//! ```bash
//! # ~/project/.sync/client_config:
//! #   [general_settings]
//! #   exclude = .git|target
//! #   [devbox]
//! #   dir = /home/me/project
//! sync ~/project
//! ```

pub mod apply;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod outlog;
pub mod peer;
pub mod protocol;
pub mod repo;
pub mod scan;
pub mod transport;
pub mod types;
pub mod util;
pub mod watcher;

// Re-export commonly used types and functions
pub use engine::{Engine, Options, Role};
pub use error::{ConnectionError, SyncError};
pub use protocol::{Action, OutMsg, StreamId, MAX_DIFF};
pub use repo::{DirectoryRecord, Repo};
pub use types::EntryStat;

// vim: ts=4
