//! End-to-end pipeline: scan a source tree, capture the emitted diff,
//! apply it to a second tree, and check both trees and their records
//! converge.

use std::collections::HashSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::duplex;
use tokio::time::{timeout, Duration};

use treesync::apply::{apply_diff, ApplyMode};
use treesync::dispatch;
use treesync::protocol::{read_frame, Action};
use treesync::repo::{Repo, REPO_FILES, REPO_TMP};
use treesync::scan::Syncer;

fn make_tree(tmp: &TempDir) -> Repo {
	std::fs::create_dir_all(tmp.path().join(REPO_TMP)).unwrap();
	std::fs::create_dir_all(tmp.path().join(REPO_FILES)).unwrap();
	Repo::new(tmp.path())
}

async fn make_syncer(repo: &Repo) -> (Syncer, impl tokio::io::AsyncRead + Unpin) {
	let handle = dispatch::spawn(None);
	let (w, r) = duplex(16 * 1024 * 1024);
	let id = handle.next_id();
	handle.add_peer(id, Box::new(w)).await;
	let syncer = Syncer::new(
		repo.clone(),
		Arc::new(HashSet::from([".sync".to_string()])),
		handle,
	);
	(syncer, r)
}

async fn next_frame(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> (Action, Vec<u8>) {
	timeout(Duration::from_secs(5), read_frame(reader)).await.unwrap().unwrap()
}

fn set_meta(path: &Path, mode: u32, mtime: i64) {
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
	filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

#[tokio::test]
async fn test_create_file_emits_expected_diff_and_applies() {
	let src = TempDir::new().unwrap();
	let dst = TempDir::new().unwrap();
	let src_repo = make_tree(&src);
	let dst_repo = make_tree(&dst);

	let (mut syncer, mut reader) = make_syncer(&src_repo).await;
	syncer.baseline().await.unwrap();

	std::fs::create_dir(src.path().join("a")).unwrap();
	std::fs::write(src.path().join("a/b.txt"), b"hi\n").unwrap();
	set_meta(&src.path().join("a/b.txt"), 0o644, 1700000000);

	syncer.sync_batch(vec![".".to_string()]).await.unwrap();

	let (action, payload) = next_frame(&mut reader).await;
	assert_eq!(action, Action::DIFF);

	// The child record precedes its parent directory's record.
	let expected = b"A a/b.txt\nmode=644 mtime=1700000000 size=3\n------------\nhi\n";
	let pos_child = payload
		.windows(expected.len())
		.position(|w| w == expected.as_slice())
		.expect("diff must carry the file record");
	let pos_parent = payload
		.windows(4)
		.position(|w| w == b"A a\n".as_slice())
		.expect("diff must carry the directory record");
	assert!(pos_child < pos_parent);

	// The source record matches what peers were told.
	let record = src_repo.load(Path::new("a")).await.unwrap();
	assert_eq!(record["b.txt"].size, 3);
	assert_eq!(record["b.txt"].mtime, 1700000000);

	// Apply on the destination: the tree and its record converge.
	apply_diff(&dst_repo, &payload, ApplyMode::Full).await.unwrap();

	assert_eq!(std::fs::read(dst.path().join("a/b.txt")).unwrap(), b"hi\n");
	let meta = std::fs::metadata(dst.path().join("a/b.txt")).unwrap();
	assert_eq!(meta.mode() & 0o777, 0o644);
	assert_eq!(meta.mtime(), 1700000000);

	let dst_record = dst_repo.load(Path::new("a")).await.unwrap();
	assert_eq!(dst_record["b.txt"], record["b.txt"]);

	// Applying the same diff again changes nothing.
	apply_diff(&dst_repo, &payload, ApplyMode::Full).await.unwrap();
	assert_eq!(std::fs::read(dst.path().join("a/b.txt")).unwrap(), b"hi\n");
	assert_eq!(dst_repo.load(Path::new("a")).await.unwrap(), dst_record);
}

#[tokio::test]
async fn test_delete_file_emits_expected_diff() {
	let src = TempDir::new().unwrap();
	let dst = TempDir::new().unwrap();
	let src_repo = make_tree(&src);
	let dst_repo = make_tree(&dst);

	std::fs::create_dir(src.path().join("a")).unwrap();
	std::fs::write(src.path().join("a/b.txt"), b"hi\n").unwrap();
	std::fs::create_dir(dst.path().join("a")).unwrap();
	std::fs::write(dst.path().join("a/b.txt"), b"hi\n").unwrap();

	let (mut syncer, mut reader) = make_syncer(&src_repo).await;
	syncer.baseline().await.unwrap();

	std::fs::remove_file(src.path().join("a/b.txt")).unwrap();
	syncer.sync_batch(vec!["a".to_string()]).await.unwrap();

	let (action, payload) = next_frame(&mut reader).await;
	assert_eq!(action, Action::DIFF);
	assert_eq!(payload, b"D a/b.txt\n------------\n".to_vec());

	apply_diff(&dst_repo, &payload, ApplyMode::Full).await.unwrap();
	assert!(!dst.path().join("a/b.txt").exists());
}

#[tokio::test]
async fn test_symlink_replacement_carries_new_target() {
	let src = TempDir::new().unwrap();
	let dst = TempDir::new().unwrap();
	let src_repo = make_tree(&src);
	let dst_repo = make_tree(&dst);

	std::os::unix::fs::symlink("old", src.path().join("link")).unwrap();

	let (mut syncer, mut reader) = make_syncer(&src_repo).await;
	syncer.baseline().await.unwrap();

	// Replacement arrives as two events: the removal, then the new link.
	std::fs::remove_file(src.path().join("link")).unwrap();
	syncer.sync_batch(vec![".".to_string()]).await.unwrap();
	let (_, payload) = next_frame(&mut reader).await;
	assert_eq!(payload, b"D link\n------------\n".to_vec());
	apply_diff(&dst_repo, &payload, ApplyMode::Full).await.unwrap();

	std::os::unix::fs::symlink("new", src.path().join("link")).unwrap();
	syncer.sync_batch(vec![".".to_string()]).await.unwrap();
	let (_, payload) = next_frame(&mut reader).await;
	assert!(payload.ends_with(b"new"));
	assert!(payload.starts_with(b"A link\n"));

	apply_diff(&dst_repo, &payload, ApplyMode::Full).await.unwrap();
	assert_eq!(std::fs::read_link(dst.path().join("link")).unwrap(), Path::new("new"));
}

#[tokio::test]
async fn test_unchanged_tree_emits_nothing() {
	let src = TempDir::new().unwrap();
	let src_repo = make_tree(&src);

	std::fs::write(src.path().join("f.txt"), b"stable").unwrap();

	let (mut syncer, mut reader) = make_syncer(&src_repo).await;
	syncer.baseline().await.unwrap();

	syncer.sync_batch(vec![".".to_string()]).await.unwrap();

	// No diff may arrive; only silence.
	let res = timeout(Duration::from_millis(200), read_frame(&mut reader)).await;
	assert!(res.is_err());
}

#[tokio::test]
async fn test_scan_matches_tree_after_batch() {
	let src = TempDir::new().unwrap();
	let src_repo = make_tree(&src);

	let (mut syncer, _reader) = make_syncer(&src_repo).await;
	syncer.baseline().await.unwrap();

	std::fs::create_dir_all(src.path().join("d1/d2")).unwrap();
	std::fs::write(src.path().join("d1/d2/f"), b"abc").unwrap();
	std::fs::write(src.path().join("top"), b"t").unwrap();

	syncer.sync_batch(vec![".".to_string()]).await.unwrap();

	// Every live entry is recorded with stats equal to a fresh lstat.
	for (dir, name) in [(".", "top"), (".", "d1"), ("d1", "d2"), ("d1/d2", "f")] {
		let record = src_repo.load(Path::new(dir)).await.unwrap();
		let stored = record.get(name).copied().expect(name);
		let meta =
			std::fs::symlink_metadata(src.path().join(dir).join(name)).unwrap();
		let live = treesync::EntryStat::from_metadata(&meta);
		assert!(stored.stats_equal(&live), "{}/{} drifted", dir, name);
	}
}

// vim: ts=4
