//! Destination mirroring rules.
//!
//! The destination tree mirrors the source tree:
//! `destination_path = destination_root + relative(source_root, source_path)`.

use std::path::{Path, PathBuf};

/// Compute a file's path relative to its source root.
///
/// Returns `None` when `source_path` is not under `source_root`.
pub fn relative_path(source_root: &Path, source_path: &Path) -> Option<PathBuf> {
    source_path
        .strip_prefix(source_root)
        .ok()
        .map(Path::to_path_buf)
}

/// Compute the mirrored destination path for a file.
pub fn mirrored_destination(
    source_root: &Path,
    source_path: &Path,
    destination_root: &Path,
) -> Option<PathBuf> {
    relative_path(source_root, source_path).map(|rel| destination_root.join(rel))
}

/// Lossy string form used for database storage.
pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_nested_paths() {
        let dest = mirrored_destination(
            Path::new("/src/photos"),
            Path::new("/src/photos/2024/trip/a.jpg"),
            Path::new("/backup/photos"),
        )
        .unwrap();
        assert_eq!(dest, Path::new("/backup/photos/2024/trip/a.jpg"));
    }

    #[test]
    fn rejects_paths_outside_root() {
        assert!(mirrored_destination(
            Path::new("/src/photos"),
            Path::new("/src/music/a.mp3"),
            Path::new("/backup"),
        )
        .is_none());
    }

    #[test]
    fn root_level_file() {
        let rel = relative_path(Path::new("/src"), Path::new("/src/a.txt")).unwrap();
        assert_eq!(rel, Path::new("a.txt"));
    }
}
