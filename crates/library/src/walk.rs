use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "m4a", "aac", "opus"];

pub fn is_supported_audio(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Every directory under `root` (root included), sorted by file name at each
/// level. Unreadable entries are logged and skipped.
pub fn directories(root: &Path) -> impl Iterator<Item = PathBuf> {
    let missing = !root.is_dir();
    if missing {
        warn!("Skipping music folder {:?}: not a directory", root);
    }
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter(move |_| !missing)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Failed to read {:?}: {}", err.path(), err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
}

/// Supported audio files directly inside `dir`, sorted by path.
pub fn audio_files_in_dir(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_supported_audio(path))
        .collect();
    files.sort();
    files
}
