//! Directory rescan diffing.
//!
//! kqueue and FEN report "something changed in this directory" without
//! naming the entry, so the engine keeps a listing per watched directory
//! and infers what happened by re-listing and diffing. Listings are keyed
//! by name with the inode attached; an entry that disappears under one
//! name and appears under another with the same inode in a single diff is
//! a rename, everything else is a plain create or remove.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryInfo {
	ino: u64,
	is_dir: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DiffEntry {
	Created { path: PathBuf, is_dir: bool },
	Removed { path: PathBuf, is_dir: bool },
	Renamed { from: PathBuf, to: PathBuf, is_dir: bool },
}

#[derive(Default)]
pub(crate) struct DirListings {
	dirs: HashMap<PathBuf, HashMap<OsString, EntryInfo>>,
}

fn list(dir: &Path) -> io::Result<HashMap<OsString, EntryInfo>> {
	let mut entries = HashMap::new();
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		// symlink_metadata: a rename must not look like a remove just
		// because the link target is gone.
		let Ok(meta) = entry.path().symlink_metadata() else { continue };
		entries.insert(
			entry.file_name(),
			EntryInfo { ino: meta.ino(), is_dir: meta.is_dir() },
		);
	}
	Ok(entries)
}

impl DirListings {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records the current contents of `dir` as the baseline for diffing.
	pub fn snapshot(&mut self, dir: &Path) -> io::Result<()> {
		let entries = list(dir)?;
		self.dirs.insert(dir.to_path_buf(), entries);
		Ok(())
	}

	pub fn forget(&mut self, dir: &Path) {
		self.dirs.remove(dir);
	}

	/// Whether a baseline listing exists for `dir`.
	pub fn contains(&self, dir: &Path) -> bool {
		self.dirs.contains_key(dir)
	}

	/// Re-lists `dir`, reports the difference to the stored baseline and
	/// makes the new listing the baseline.
	pub fn diff(&mut self, dir: &Path) -> io::Result<Vec<DiffEntry>> {
		let new = list(dir)?;
		let old = self.dirs.insert(dir.to_path_buf(), new.clone()).unwrap_or_default();

		let mut gone: Vec<(&OsString, &EntryInfo)> =
			old.iter().filter(|(name, _)| !new.contains_key(*name)).collect();
		let appeared: Vec<(&OsString, &EntryInfo)> =
			new.iter().filter(|(name, _)| !old.contains_key(*name)).collect();

		let mut out = Vec::new();

		for (name, info) in &appeared {
			// Same inode vanished under another name in this very diff:
			// that's one rename, not a remove plus a create.
			if let Some(pos) = gone.iter().position(|(_, g)| g.ino == info.ino) {
				let (old_name, _) = gone.swap_remove(pos);
				out.push(DiffEntry::Renamed {
					from: dir.join(old_name),
					to: dir.join(name),
					is_dir: info.is_dir,
				});
			} else {
				out.push(DiffEntry::Created { path: dir.join(name), is_dir: info.is_dir });
			}
		}

		for (name, info) in gone {
			out.push(DiffEntry::Removed { path: dir.join(name), is_dir: info.is_dir });
		}

		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_entry_is_a_create() {
		let root = tempfile::tempdir().unwrap();
		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();

		let file = root.path().join("a");
		std::fs::write(&file, b"").unwrap();

		let diff = listings.diff(root.path()).unwrap();
		assert_eq!(diff, vec![DiffEntry::Created { path: file, is_dir: false }]);
	}

	#[test]
	fn missing_entry_is_a_remove() {
		let root = tempfile::tempdir().unwrap();
		let file = root.path().join("a");
		std::fs::write(&file, b"").unwrap();

		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();
		std::fs::remove_file(&file).unwrap();

		let diff = listings.diff(root.path()).unwrap();
		assert_eq!(diff, vec![DiffEntry::Removed { path: file, is_dir: false }]);
	}

	#[test]
	fn same_inode_under_new_name_is_a_rename() {
		let root = tempfile::tempdir().unwrap();
		let from = root.path().join("a");
		let to = root.path().join("b");
		std::fs::write(&from, b"payload").unwrap();

		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();
		std::fs::rename(&from, &to).unwrap();

		let diff = listings.diff(root.path()).unwrap();
		assert_eq!(diff, vec![DiffEntry::Renamed { from, to, is_dir: false }]);
	}

	#[test]
	fn diff_advances_the_baseline() {
		let root = tempfile::tempdir().unwrap();
		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();

		std::fs::write(root.path().join("a"), b"").unwrap();
		assert_eq!(listings.diff(root.path()).unwrap().len(), 1);
		// Nothing changed since the last diff.
		assert!(listings.diff(root.path()).unwrap().is_empty());
	}

	#[test]
	fn forget_drops_the_baseline() {
		let root = tempfile::tempdir().unwrap();
		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();
		assert!(listings.contains(root.path()));

		listings.forget(root.path());
		assert!(!listings.contains(root.path()));
	}

	#[test]
	fn directories_carry_the_flag() {
		let root = tempfile::tempdir().unwrap();
		let mut listings = DirListings::new();
		listings.snapshot(root.path()).unwrap();

		let sub = root.path().join("sub");
		std::fs::create_dir(&sub).unwrap();

		let diff = listings.diff(root.path()).unwrap();
		assert_eq!(diff, vec![DiffEntry::Created { path: sub, is_dir: true }]);
	}
}
