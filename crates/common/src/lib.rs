use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HASH_BLOCK_SIZE: usize = 64 * 1024;
const MAX_CACHE_NAME_LEN: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: i64,
    pub name: String,
    pub artist_id: Option<i64>,
    #[serde(default)]
    pub artist_name: Option<String>,
    pub year: Option<i32>,
    pub art_filename: Option<String>,
    #[serde(default)]
    pub art_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub path: String,
    pub fingerprint: Option<String>,
    pub title: Option<String>,
    pub album_id: Option<i64>,
    #[serde(default)]
    pub album_name: Option<String>,
    pub artist_id: Option<i64>,
    #[serde(default)]
    pub artist_name: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub duration_secs: Option<f64>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub last_modified: Option<f64>,
    pub indexed_at: Option<i64>,
}

/// Per-track fields written by an upsert, already normalized by the scanner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackTags {
    pub title: String,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub duration_secs: f64,
    pub genre: Option<String>,
    pub year: Option<i32>,
}

/// Content fingerprint of a file: blake3 over the full byte stream, hex encoded.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn short_hash(input: &str, len: usize) -> String {
    let hex = blake3::hash(input.as_bytes()).to_hex();
    let len = len.min(hex.len());
    hex[..len].to_string()
}

/// Reduces an arbitrary display name to something safe inside a cache filename.
pub fn sanitize_for_cache(name: &str) -> String {
    if name.is_empty() {
        return "unknown_file".to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for ch in name.chars() {
        if matches!(ch, '.' | '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            continue;
        }
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            if !last_sep {
                out.push('_');
                last_sep = true;
            }
            continue;
        }
        out.push(ch);
        last_sep = false;
    }
    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '-')
        .chars()
        .take(MAX_CACHE_NAME_LEN)
        .collect();
    if trimmed.is_empty() {
        "sanitized_empty".to_string()
    } else {
        trimmed
    }
}

pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn modified_secs(path: &Path) -> io::Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs_f64())
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}
