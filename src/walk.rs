//! Directory enumeration for seeding watches.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Returns every directory under `roots`, in pre-order, roots included.
///
/// Handy for seeding a non-recursive watcher with a whole tree. Fails if
/// any root cannot be walked.
pub fn dir_names<I, P>(roots: I) -> Result<Vec<PathBuf>>
where
	I: IntoIterator<Item = P>,
	P: AsRef<Path>,
{
	let mut dirs = Vec::new();
	for root in roots {
		for entry in WalkDir::new(root.as_ref()) {
			let entry = entry.map_err(walk_error)?;
			if entry.file_type().is_dir() {
				dirs.push(entry.into_path());
			}
		}
	}
	Ok(dirs)
}

pub(crate) fn walk_error(e: walkdir::Error) -> Error {
	let path = e.path().map(Path::to_path_buf);
	match (path, e.into_io_error()) {
		(Some(path), Some(source)) => Error::watch(path, source),
		(None, Some(source)) => Error::Io(source),
		// Only loops produce walkdir errors without an io cause, and we
		// don't follow symlinks; map it anyway rather than panic.
		(path, None) => Error::PathNotFound(path.unwrap_or_default()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lists_directories_in_pre_order() {
		let root = tempfile::tempdir().unwrap();
		let a = root.path().join("a");
		let nested = a.join("nested");
		std::fs::create_dir_all(&nested).unwrap();
		std::fs::write(root.path().join("file"), b"not a dir").unwrap();

		let dirs = dir_names([root.path()]).unwrap();

		assert_eq!(dirs, vec![root.path().to_path_buf(), a, nested]);
	}

	#[test]
	fn missing_root_is_an_error() {
		let root = tempfile::tempdir().unwrap();
		let gone = root.path().join("gone");

		assert!(dir_names([&gone]).is_err());
	}

	#[test]
	fn multiple_roots_are_concatenated() {
		let first = tempfile::tempdir().unwrap();
		let second = tempfile::tempdir().unwrap();

		let dirs = dir_names([first.path(), second.path()]).unwrap();

		assert_eq!(dirs, vec![first.path().to_path_buf(), second.path().to_path_buf()]);
	}
}
