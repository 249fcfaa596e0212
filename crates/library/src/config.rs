use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub version: u32,
    pub data_dir: String,
    pub database_name: String,
    pub art_dir: String,
    pub music_folders: Vec<String>,
    pub art_max_dim: u32,
    pub art_quality: u8,
    pub progress_every: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            data_dir: "data".to_string(),
            database_name: "library.sqlite".to_string(),
            art_dir: "art_thumbnails".to_string(),
            music_folders: Vec::new(),
            art_max_dim: 200,
            art_quality: 80,
            progress_every: 10,
        }
    }
}

impl LibraryConfig {
    pub fn database_path(&self, config_path: &Path) -> PathBuf {
        resolve_path(config_path, &self.data_dir).join(&self.database_name)
    }

    pub fn art_path(&self, config_path: &Path) -> PathBuf {
        resolve_path(config_path, &self.data_dir).join(&self.art_dir)
    }

    pub fn music_folder_paths(&self, config_path: &Path) -> Vec<PathBuf> {
        self.music_folders
            .iter()
            .map(|folder| folder.trim())
            .filter(|folder| !folder.is_empty())
            .map(|folder| resolve_path(config_path, folder))
            .collect()
    }

    /// Adds a folder to the scan list. Returns `false` if it is already present.
    pub fn add_music_folder(&mut self, folder: &Path) -> Result<bool, ConfigError> {
        if !folder.is_dir() {
            return Err(ConfigError::NotADirectory(folder.to_path_buf()));
        }
        let normalized = fs::canonicalize(folder)?.to_string_lossy().to_string();
        if self.music_folders.iter().any(|existing| same_folder(existing, &normalized)) {
            return Ok(false);
        }
        self.music_folders.push(normalized);
        Ok(true)
    }

    pub fn remove_music_folder(&mut self, folder: &Path) -> bool {
        let raw = folder.to_string_lossy().to_string();
        let normalized = fs::canonicalize(folder)
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|_| raw.clone());
        let before = self.music_folders.len();
        self.music_folders
            .retain(|existing| !same_folder(existing, &raw) && !same_folder(existing, &normalized));
        self.music_folders.len() != before
    }
}

fn same_folder(existing: &str, candidate: &str) -> bool {
    let clean = |value: &str| value.trim().trim_end_matches(|c| c == '/' || c == '\\').to_string();
    clean(existing) == clean(candidate)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    NotADirectory(PathBuf),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
            ConfigError::NotADirectory(path) => write!(f, "not a directory: {:?}", path),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LIBRARY_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(LibraryConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: LibraryConfig = serde_yaml::from_str(&contents)?;
        let defaults = LibraryConfig::default();
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.data_dir.trim().is_empty() {
            config.data_dir = defaults.data_dir;
        }
        if config.database_name.trim().is_empty() {
            config.database_name = defaults.database_name;
        }
        if config.art_dir.trim().is_empty() {
            config.art_dir = defaults.art_dir;
        }
        if config.art_max_dim == 0 {
            config.art_max_dim = defaults.art_max_dim;
        }
        if config.art_quality == 0 || config.art_quality > 100 {
            config.art_quality = defaults.art_quality;
        }
        if config.progress_every == 0 {
            config.progress_every = defaults.progress_every;
        }
        return Ok((config, false));
    }

    let config = LibraryConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &LibraryConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
