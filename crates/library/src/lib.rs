use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{Album, Artist, Track};
use metadata::{LoftyReader, MetadataReader};
use tracing::info;

pub mod art;
pub mod config;
pub mod error;
pub mod progress;
pub mod scan;
pub mod schema;
pub mod store;
pub mod walk;

pub use art::ArtCache;
pub use config::{ConfigError, LibraryConfig};
pub use error::LibraryError;
pub use progress::{ProgressListener, ScanProgress};
pub use scan::{ScanCoordinator, ScanOutcome, ScanPhase, ScanStatus, ScanSummary};
pub use store::{LibraryStats, LibraryStore, ScanErrorEntry};

/// Everything one configured library needs: its config file, the index,
/// the art cache and the scanner that writes to them.
pub struct Library {
    config_path: PathBuf,
    config: LibraryConfig,
    store: LibraryStore,
    scanner: ScanCoordinator,
}

impl Library {
    /// Loads (or creates) the config at `config_path` and opens the index it
    /// points to, reading tags with lofty.
    pub fn open(config_path: &Path) -> Result<Self, LibraryError> {
        let (config, created) = config::load_or_create_config(config_path)?;
        if created {
            info!("Created default config at {:?}", config_path);
        }
        Self::with_reader(config_path.to_path_buf(), config, Arc::new(LoftyReader))
    }

    pub fn with_reader(
        config_path: PathBuf,
        config: LibraryConfig,
        reader: Arc<dyn MetadataReader>,
    ) -> Result<Self, LibraryError> {
        let art_dir = config.art_path(&config_path);
        let store = LibraryStore::open(config.database_path(&config_path), art_dir.clone())?;
        let art = ArtCache::new(art_dir, config.art_max_dim, config.art_quality);
        let scanner = ScanCoordinator::new(store.clone(), art, reader, config.progress_every);
        Ok(Self {
            config_path,
            config,
            store,
            scanner,
        })
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    pub fn scanner(&self) -> &ScanCoordinator {
        &self.scanner
    }

    pub fn music_folders(&self) -> Vec<PathBuf> {
        self.config.music_folder_paths(&self.config_path)
    }

    /// Scans the configured music folders in the background.
    pub fn start_scan(&self, full_rescan: bool, listener: Arc<dyn ProgressListener>) -> bool {
        self.scanner.start(self.music_folders(), full_rescan, listener)
    }

    pub fn stop_scan(&self) -> bool {
        self.scanner.stop()
    }

    pub fn add_music_folder(&mut self, folder: &Path) -> Result<bool, LibraryError> {
        let added = self.config.add_music_folder(folder)?;
        if added {
            config::save_config(&self.config_path, &self.config)?;
            info!("Added music folder {:?}", folder);
        }
        Ok(added)
    }

    pub fn remove_music_folder(&mut self, folder: &Path) -> Result<bool, LibraryError> {
        let removed = self.config.remove_music_folder(folder);
        if removed {
            config::save_config(&self.config_path, &self.config)?;
            info!("Removed music folder {:?}", folder);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        self.store.stats()
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, LibraryError> {
        self.store.list_artists()
    }

    pub fn list_albums(&self, artist_id: Option<i64>) -> Result<Vec<Album>, LibraryError> {
        self.store.list_albums(artist_id)
    }

    pub fn list_tracks(&self, album_id: i64) -> Result<Vec<Track>, LibraryError> {
        self.store.list_tracks(album_id)
    }

    pub fn find_track_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        self.store.find_track_by_path(path)
    }

    pub fn find_art_path_for_track(&self, path: &str) -> Result<Option<PathBuf>, LibraryError> {
        self.store.find_art_path_for_track(path)
    }

    pub fn track_path(&self, track_id: i64) -> Result<Option<String>, LibraryError> {
        self.store.track_path(track_id)
    }

    pub fn list_scan_errors(&self) -> Result<Vec<ScanErrorEntry>, LibraryError> {
        self.store.list_scan_errors()
    }
}
