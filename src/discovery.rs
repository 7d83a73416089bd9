use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions accepted as input, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "avif"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Lists every supported image below `root`, sorted by path.
///
/// Paths resolving to the same file are reported once, under the first name in
/// sort order. A tree without images yields an empty list.
pub fn discover(root: &Path) -> Vec<PathBuf> {
    let mut candidates = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.into_path()),
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {err}", root.display());
                None
            }
        })
        .filter(|path| path.is_file() && is_supported_image(path))
        .collect::<Vec<_>>();
    candidates.sort();

    let mut seen = HashSet::new();
    candidates.retain(|path| {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        let first = seen.insert(key);
        if !first {
            debug!("{} is a duplicate of an earlier file", path.display());
        }
        first
    });
    candidates
}
