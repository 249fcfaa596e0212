use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::{fingerprint_file, modified_secs, path_key, TrackTags};
use metadata::MetadataReader;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::art::ArtCache;
use crate::error::LibraryError;
use crate::progress::{fraction, ProgressListener, ScanProgress};
use crate::store::{self, LibraryStore};
use crate::walk;

const UNKNOWN_ALBUM: &str = "Unknown Album";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    Idle,
    Counting,
    Processing,
    Pruning,
    Cancelling,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    Empty,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub outcome: ScanOutcome,
    pub total: usize,
    pub processed: usize,
    /// Files whose rows were inserted or rewritten.
    pub changed: usize,
    pub unreadable: usize,
    pub failed: usize,
    pub pruned: usize,
}

impl ScanSummary {
    fn new() -> Self {
        Self {
            outcome: ScanOutcome::Completed,
            total: 0,
            processed: 0,
            changed: 0,
            unreadable: 0,
            failed: 0,
            pruned: 0,
        }
    }

    fn terminal_event(&self) -> ScanProgress {
        match &self.outcome {
            ScanOutcome::Completed => ScanProgress::finished(
                self.processed,
                self.total,
                1.0,
                format!("Scan complete: {}/{}", self.processed, self.total),
            ),
            ScanOutcome::Cancelled => ScanProgress::finished(
                self.processed,
                self.total,
                fraction(self.processed, self.total),
                format!("Scan cancelled: {}/{}", self.processed, self.total),
            ),
            ScanOutcome::Empty => {
                ScanProgress::finished(0, 0, 1.0, "No music files found")
            }
            ScanOutcome::Failed(reason) => ScanProgress::finished(
                self.processed,
                self.total,
                1.0,
                format!("Scan failed: {}", reason),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
    pub message: String,
    pub last_summary: Option<ScanSummary>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            phase: ScanPhase::Idle,
            processed: 0,
            total: 0,
            message: String::new(),
            last_summary: None,
        }
    }
}

enum FileOutcome {
    Unchanged,
    Changed,
}

struct Inner {
    store: LibraryStore,
    art: ArtCache,
    reader: Arc<dyn MetadataReader>,
    progress_every: usize,
    state: Mutex<ScanStatus>,
    cancel: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Runs at most one library scan at a time on a background thread.
#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

impl ScanCoordinator {
    pub fn new(
        store: LibraryStore,
        art: ArtCache,
        reader: Arc<dyn MetadataReader>,
        progress_every: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                art,
                reader,
                progress_every: progress_every.max(1),
                state: Mutex::new(ScanStatus::default()),
                cancel: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Starts a scan of `folders`. Returns `false`, changing nothing, when a
    /// scan is already running.
    pub fn start(
        &self,
        folders: Vec<PathBuf>,
        full_rescan: bool,
        listener: Arc<dyn ProgressListener>,
    ) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.phase != ScanPhase::Idle {
                debug!("Scan already running ({:?}); ignoring start", state.phase);
                return false;
            }
            // Cleared under the lock so a stop() racing this start is never lost.
            self.inner.cancel.store(false, Ordering::SeqCst);
            state.phase = ScanPhase::Counting;
            state.processed = 0;
            state.total = 0;
            state.message = String::new();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("library-scan".to_string())
            .spawn(move || inner.run(&folders, full_rescan, listener.as_ref()));
        match spawned {
            Ok(handle) => {
                *self.inner.worker.lock() = Some(handle);
                true
            }
            Err(err) => {
                warn!("Failed to spawn scan worker: {}", err);
                self.inner.state.lock().phase = ScanPhase::Idle;
                false
            }
        }
    }

    /// Requests cancellation of a scan that is counting or processing.
    /// Returns whether the request was accepted; never blocks on the worker.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state.lock();
        match state.phase {
            ScanPhase::Counting | ScanPhase::Processing => {
                self.inner.cancel.store(true, Ordering::SeqCst);
                state.phase = ScanPhase::Cancelling;
                info!("Scan cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().phase != ScanPhase::Idle
    }

    /// Blocks until the current worker exits and returns its summary.
    pub fn wait(&self) -> Option<ScanSummary> {
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Scan worker panicked");
                let mut state = self.inner.state.lock();
                state.phase = ScanPhase::Idle;
                state.message = "Scan failed: worker panicked".to_string();
            }
        }
        self.status().last_summary
    }
}

impl Inner {
    fn run(&self, folders: &[PathBuf], full_rescan: bool, listener: &dyn ProgressListener) {
        let mut summary = ScanSummary::new();
        let outcome = match self.scan(folders, full_rescan, listener, &mut summary) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Scan failed: {}", err);
                ScanOutcome::Failed(err.to_string())
            }
        };
        summary.outcome = outcome;
        let terminal = summary.terminal_event();
        info!(
            "{} ({} changed, {} unreadable, {} failed, {} pruned)",
            terminal.message, summary.changed, summary.unreadable, summary.failed, summary.pruned
        );
        {
            let mut state = self.state.lock();
            state.phase = ScanPhase::Idle;
            state.processed = summary.processed;
            state.total = summary.total;
            state.message = terminal.message.clone();
            state.last_summary = Some(summary);
        }
        listener.on_progress(&terminal);
    }

    fn scan(
        &self,
        folders: &[PathBuf],
        full_rescan: bool,
        listener: &dyn ProgressListener,
        summary: &mut ScanSummary,
    ) -> Result<ScanOutcome, LibraryError> {
        self.emit(listener, ScanProgress::running(0, 0, "Calculating total files..."));
        summary.total = self.count_files(folders);
        if self.cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }
        if summary.total == 0 {
            return Ok(ScanOutcome::Empty);
        }
        info!("Found {} files in {} music folders", summary.total, folders.len());

        if !self.advance(ScanPhase::Processing) {
            return Ok(ScanOutcome::Cancelled);
        }
        self.emit(
            listener,
            ScanProgress::running(
                0,
                summary.total,
                format!("Found {} files to scan. Processing...", summary.total),
            ),
        );

        let mut conn = self.store.connect()?;
        let mut seen_paths = HashSet::new();
        self.process_folders(&mut conn, folders, listener, summary, &mut seen_paths)?;
        if self.cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }

        if full_rescan {
            if !self.advance(ScanPhase::Pruning) {
                return Ok(ScanOutcome::Cancelled);
            }
            self.emit(
                listener,
                ScanProgress::running(summary.processed, summary.total, "Removing obsolete tracks..."),
            );
            let tx = conn.transaction()?;
            summary.pruned = store::prune_tracks_not_in(&tx, &seen_paths)?;
            tx.commit()?;
            info!("Removed {} obsolete tracks", summary.pruned);
        }
        Ok(ScanOutcome::Completed)
    }

    fn count_files(&self, folders: &[PathBuf]) -> usize {
        let mut total = 0usize;
        'folders: for folder in folders {
            for dir in walk::directories(folder) {
                if self.cancelled() {
                    break 'folders;
                }
                for _ in walk::audio_files_in_dir(&dir) {
                    if self.cancelled() {
                        break 'folders;
                    }
                    total += 1;
                }
            }
        }
        total
    }

    // One transaction per directory, committed even when cancelled mid-way.
    fn process_folders(
        &self,
        conn: &mut Connection,
        folders: &[PathBuf],
        listener: &dyn ProgressListener,
        summary: &mut ScanSummary,
        seen_paths: &mut HashSet<String>,
    ) -> Result<(), LibraryError> {
        for folder in folders {
            for dir in walk::directories(folder) {
                if self.cancelled() {
                    return Ok(());
                }
                let files = walk::audio_files_in_dir(&dir);
                if files.is_empty() {
                    continue;
                }
                debug!("Scanning {:?} ({} files)", dir, files.len());

                let tx = conn.transaction()?;
                for file in files {
                    if self.cancelled() {
                        break;
                    }
                    let key = path_key(&file);
                    let outcome = self.process_file(&tx, &file, &key);
                    // A file deleted since the directory was listed must not shield its row from pruning.
                    let vanished = matches!(
                        &outcome,
                        Err(LibraryError::Io(err)) if err.kind() == io::ErrorKind::NotFound
                    );
                    match outcome {
                        Ok(FileOutcome::Unchanged) => {}
                        Ok(FileOutcome::Changed) => summary.changed += 1,
                        Err(LibraryError::Metadata(err)) => {
                            warn!("Failed to read tags for {:?}: {}", file, err);
                            summary.unreadable += 1;
                            if let Err(err) = store::record_scan_error(&tx, &key, &err.to_string()) {
                                warn!("Failed to record scan error for {:?}: {}", file, err);
                            }
                        }
                        Err(err) => {
                            warn!("Failed to index {:?}: {}", file, err);
                            summary.failed += 1;
                        }
                    }
                    if !vanished {
                        seen_paths.insert(key);
                    }
                    summary.processed += 1;
                    self.state.lock().processed = summary.processed;
                    if summary.processed % self.progress_every == 0 {
                        self.emit(
                            listener,
                            ScanProgress::running(
                                summary.processed,
                                summary.total,
                                format!("Scanned: {}/{} files...", summary.processed, summary.total),
                            ),
                        );
                    }
                }
                tx.commit()?;
            }
        }
        Ok(())
    }

    fn process_file(
        &self,
        conn: &Connection,
        file: &Path,
        key: &str,
    ) -> Result<FileOutcome, LibraryError> {
        let last_modified = modified_secs(file)?;
        let fingerprint = fingerprint_file(file)?;
        if store::track_is_unchanged(conn, key, &fingerprint, last_modified)? {
            return Ok(FileOutcome::Unchanged);
        }

        let tags = self.reader.extract(file)?;

        let artist_id = match tags.artist.as_deref() {
            Some(name) => store::get_or_create_artist(conn, name)?,
            None => None,
        };
        let album_artist_id = match tags.album_artist.as_deref() {
            Some(name) => store::get_or_create_artist(conn, name)?,
            None => artist_id,
        };
        let album_name = tags.album.as_deref().unwrap_or(UNKNOWN_ALBUM);
        let album_id = store::get_or_create_album(conn, album_name, album_artist_id, tags.year)?;

        if let (Some(album_id), Some(art)) = (album_id, tags.art.as_deref()) {
            if !store::album_has_art(conn, album_id)? {
                if let Some(filename) = self.art.cache(art, album_id, album_name) {
                    store::set_album_art_if_missing(conn, album_id, &filename)?;
                }
            }
        }

        let track_tags = TrackTags {
            title: tags.title.clone().unwrap_or_else(|| file_stem(file)),
            track_no: tags.track_no,
            disc_no: tags.disc_no,
            duration_secs: tags.duration_secs,
            genre: tags.genre.clone(),
            year: tags.year,
        };
        store::upsert_track(
            conn,
            key,
            &fingerprint,
            &track_tags,
            album_id,
            artist_id,
            last_modified,
        )?;
        Ok(FileOutcome::Changed)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Moves to `phase` unless a stop request got there first.
    fn advance(&self, phase: ScanPhase) -> bool {
        let mut state = self.state.lock();
        if state.phase == ScanPhase::Cancelling || self.cancelled() {
            return false;
        }
        state.phase = phase;
        true
    }

    fn emit(&self, listener: &dyn ProgressListener, progress: ScanProgress) {
        {
            let mut state = self.state.lock();
            state.processed = progress.processed;
            state.total = progress.total;
            state.message = progress.message.clone();
        }
        listener.on_progress(&progress);
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path_key(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use metadata::{MetadataError, TagSet};
    use std::fs;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Reads `key=value` lines instead of audio tags. Files whose name starts
    /// with "corrupt" are unreadable.
    struct StubReader;

    impl MetadataReader for StubReader {
        fn extract(&self, path: &Path) -> Result<TagSet, MetadataError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with("corrupt") {
                return Err(MetadataError::Unreadable("bad frame header".to_string()));
            }
            let text = fs::read_to_string(path)?;
            let mut tags = TagSet {
                duration_secs: 120.0,
                ..TagSet::default()
            };
            for line in text.lines() {
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let value = value.trim().to_string();
                match key.trim() {
                    "title" => tags.title = Some(value),
                    "artist" => tags.artist = Some(value),
                    "album_artist" => tags.album_artist = Some(value),
                    "album" => tags.album = Some(value),
                    "track" => tags.track_no = value.parse().ok(),
                    "year" => tags.year = value.parse().ok(),
                    "art" if value == "png" => tags.art = Some(png_bytes()),
                    "art" if value == "empty" => tags.art = Some(Vec::new()),
                    _ => {}
                }
            }
            Ok(tags)
        }
    }

    /// Announces each extraction on `entered`, then blocks until a unit
    /// arrives on the gate or its sender is dropped.
    struct GateReader {
        entered: Mutex<mpsc::Sender<()>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl MetadataReader for GateReader {
        fn extract(&self, path: &Path) -> Result<TagSet, MetadataError> {
            let _ = self.entered.lock().send(());
            let _ = self.gate.lock().recv();
            StubReader.extract(path)
        }
    }

    fn gate_reader() -> (Arc<dyn MetadataReader>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let reader = GateReader {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        };
        (Arc::new(reader), entered_rx, gate_tx)
    }

    /// A second coordinator over the fixture's index, reading through `reader`.
    fn coordinator_over(fixture: &Fixture, reader: Arc<dyn MetadataReader>) -> ScanCoordinator {
        let art = ArtCache::new(fixture.store.art_dir().to_path_buf(), 200, 80);
        ScanCoordinator::new(fixture.store.clone(), art, reader, 10)
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 64, |x, _| Rgb([x as u8, 40u8, 200u8]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        music: PathBuf,
        store: LibraryStore,
        coordinator: ScanCoordinator,
    }

    fn fixture_with(reader: Arc<dyn MetadataReader>, progress_every: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(&music).unwrap();
        let art_dir = dir.path().join("data").join("art");
        let store =
            LibraryStore::open(dir.path().join("data").join("library.sqlite"), art_dir.clone())
                .unwrap();
        let art = ArtCache::new(art_dir, 200, 80);
        let coordinator = ScanCoordinator::new(store.clone(), art, reader, progress_every);
        Fixture {
            _dir: dir,
            music,
            store,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(StubReader), 10)
    }

    fn write_track(root: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    type Events = Arc<Mutex<Vec<ScanProgress>>>;

    fn recorder() -> (Arc<dyn ProgressListener>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: Arc<dyn ProgressListener> =
            Arc::new(move |progress: &ScanProgress| sink.lock().push(progress.clone()));
        (listener, events)
    }

    fn run_scan(fixture: &Fixture, full_rescan: bool) -> (ScanSummary, Vec<ScanProgress>) {
        let (listener, events) = recorder();
        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], full_rescan, listener));
        let summary = fixture.coordinator.wait().unwrap();
        let events = events.lock().clone();
        (summary, events)
    }

    fn assert_well_formed(events: &[ScanProgress]) {
        assert_eq!(events.first().unwrap().message, "Calculating total files...");
        assert_eq!(events.iter().filter(|event| event.done).count(), 1);
        assert!(events.last().unwrap().done);
        for pair in events.windows(2) {
            assert!(pair[0].processed <= pair[1].processed);
        }
    }

    #[test]
    fn only_supported_files_are_counted_and_indexed() {
        let fixture = fixture();
        write_track(&fixture.music, "Queen/Opera/01.mp3", "title=Death on Two Legs\nartist=Queen\nalbum=A Night at the Opera\ntrack=1");
        write_track(&fixture.music, "Queen/Opera/02.FLAC", "title=Lazing\nartist=queen\nalbum=A Night at the Opera\ntrack=2");
        write_track(&fixture.music, "Queen/Opera/03.ogg", "artist=Queen\nalbum=A Night at the Opera\ntrack=3");
        write_track(&fixture.music, "Queen/Opera/notes.txt", "title=nope");
        write_track(&fixture.music, "Queen/Opera/cover.jpg", "jpeg");

        let (summary, events) = run_scan(&fixture, false);
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.changed, 3);
        assert_well_formed(&events);
        assert_eq!(events[1].message, "Found 3 files to scan. Processing...");
        let last = events.last().unwrap();
        assert_eq!(last.message, "Scan complete: 3/3");
        assert_eq!(last.fraction, 1.0);

        let artists = fixture.store.list_artists().unwrap();
        assert_eq!(artists.len(), 1);
        let albums = fixture.store.list_albums(Some(artists[0].id)).unwrap();
        assert_eq!(albums.len(), 1);
        let tracks = fixture.store.list_tracks(albums[0].id).unwrap();
        let titles: Vec<_> = tracks.iter().filter_map(|track| track.title.clone()).collect();
        assert_eq!(titles, vec!["Death on Two Legs", "Lazing", "03"]);

        let status = fixture.coordinator.status();
        assert_eq!(status.phase, ScanPhase::Idle);
        assert_eq!(status.message, "Scan complete: 3/3");
    }

    #[test]
    fn unchanged_rescan_rewrites_nothing() {
        let fixture = fixture();
        let path = write_track(&fixture.music, "a/01.mp3", "title=One\nartist=A\nalbum=Alpha");
        run_scan(&fixture, false);
        let key = path_key(&path);
        let before = fixture.store.find_track_by_path(&key).unwrap().unwrap();

        let (summary, _) = run_scan(&fixture, false);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.changed, 0);
        let after = fixture.store.find_track_by_path(&key).unwrap().unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(before.indexed_at, after.indexed_at);
    }

    #[test]
    fn full_rescan_prunes_only_deleted_files() {
        let fixture = fixture();
        let keep = write_track(&fixture.music, "a/01.mp3", "title=Keep\nalbum=Alpha");
        let gone = write_track(&fixture.music, "a/02.mp3", "title=Gone\nalbum=Alpha");
        run_scan(&fixture, false);
        fs::remove_file(&gone).unwrap();

        let (summary, _) = run_scan(&fixture, false);
        assert_eq!(summary.pruned, 0);
        assert!(fixture.store.find_track_by_path(&path_key(&gone)).unwrap().is_some());

        let (summary, events) = run_scan(&fixture, true);
        assert_eq!(summary.pruned, 1);
        assert!(events.iter().any(|event| event.message == "Removing obsolete tracks..."));
        assert!(fixture.store.find_track_by_path(&path_key(&gone)).unwrap().is_none());
        assert!(fixture.store.find_track_by_path(&path_key(&keep)).unwrap().is_some());
    }

    #[test]
    fn empty_and_missing_folders_report_no_files() {
        let fixture = fixture();
        let (summary, events) = run_scan(&fixture, true);
        assert_eq!(summary.outcome, ScanOutcome::Empty);
        assert_well_formed(&events);
        assert_eq!(events.last().unwrap().message, "No music files found");

        let (listener, events) = recorder();
        assert!(fixture
            .coordinator
            .start(vec![fixture.music.join("missing")], false, listener));
        assert_eq!(fixture.coordinator.wait().unwrap().outcome, ScanOutcome::Empty);
        assert!(events.lock().last().unwrap().done);

        let (listener, _) = recorder();
        assert!(fixture.coordinator.start(Vec::new(), false, listener));
        assert_eq!(fixture.coordinator.wait().unwrap().outcome, ScanOutcome::Empty);
    }

    #[test]
    fn unreadable_files_are_counted_and_recorded() {
        let fixture = fixture();
        write_track(&fixture.music, "a/01.mp3", "title=Fine\nalbum=Alpha");
        let broken = write_track(&fixture.music, "a/corrupt.mp3", "garbage");

        let (summary, _) = run_scan(&fixture, false);
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.unreadable, 1);
        assert_eq!(fixture.store.stats().unwrap().tracks, 1);
        let errors = fixture.store.list_scan_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, path_key(&broken));
        assert!(errors[0].message.contains("bad frame header"));
    }

    #[test]
    fn art_comes_from_the_first_track_with_usable_art() {
        let fixture = fixture();
        write_track(&fixture.music, "a/01.mp3", "title=One\nartist=A\nalbum=Alpha\nart=empty");
        write_track(&fixture.music, "a/02.mp3", "title=Two\nartist=A\nalbum=Alpha\nart=png");
        write_track(&fixture.music, "b/01.mp3", "title=Solo\nartist=B\nalbum=Beta\nart=empty");

        run_scan(&fixture, false);
        let albums = fixture.store.list_albums(None).unwrap();
        let alpha = albums.iter().find(|album| album.name == "Alpha").unwrap();
        let beta = albums.iter().find(|album| album.name == "Beta").unwrap();
        assert!(alpha.art_filename.is_some());
        assert!(alpha.art_path.as_ref().unwrap().is_file());
        assert_eq!(beta.art_filename, None);
    }

    #[test]
    fn album_artist_owns_the_album() {
        let fixture = fixture();
        write_track(&fixture.music, "c/01.mp3", "title=X\nartist=Guest\nalbum_artist=Various\nalbum=Mix");
        write_track(&fixture.music, "c/02.mp3", "title=Y\nartist=Host\nalbum_artist=Various\nalbum=Mix");

        run_scan(&fixture, false);
        let albums = fixture.store.list_albums(None).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].artist_name.as_deref(), Some("Various"));
        let performers: Vec<_> = fixture
            .store
            .list_tracks(albums[0].id)
            .unwrap()
            .into_iter()
            .filter_map(|track| track.artist_name)
            .collect();
        assert_eq!(performers, vec!["Guest", "Host"]);
    }

    #[test]
    fn stop_keeps_a_clean_prefix_and_restart_finishes() {
        let fixture = fixture_with(Arc::new(StubReader), 1);
        for n in 1..=5 {
            write_track(&fixture.music, &format!("a/0{}.mp3", n), &format!("title=T{}\nalbum=Alpha", n));
        }
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = fixture.coordinator.clone();
        let listener: Arc<dyn ProgressListener> = Arc::new(move |progress: &ScanProgress| {
            if progress.processed == 2 && !progress.done {
                handle.stop();
            }
            sink.lock().push(progress.clone());
        });

        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], true, listener));
        let summary = fixture.coordinator.wait().unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.pruned, 0);
        let last = events.lock().last().unwrap().clone();
        assert_eq!(last.message, "Scan cancelled: 2/5");
        assert!((last.fraction - 0.4).abs() < 1e-9);
        assert_eq!(fixture.store.stats().unwrap().tracks, 2);
        assert!(fixture
            .store
            .find_track_by_path(&path_key(&fixture.music.join("a/01.mp3")))
            .unwrap()
            .is_some());

        let (summary, _) = run_scan(&fixture, false);
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.changed, 3);
        assert_eq!(fixture.store.stats().unwrap().tracks, 5);
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let (reader, _entered, gate_tx) = gate_reader();
        let fixture = fixture_with(reader, 10);
        write_track(&fixture.music, "a/01.mp3", "title=One");
        write_track(&fixture.music, "a/02.mp3", "title=Two");

        let (listener, events) = recorder();
        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], false, listener));
        let (other, other_events) = recorder();
        assert!(!fixture
            .coordinator
            .start(vec![fixture.music.clone()], false, other));
        assert!(fixture.coordinator.is_running());

        drop(gate_tx);
        let summary = fixture.coordinator.wait().unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(events.lock().iter().filter(|event| event.done).count(), 1);
        assert!(other_events.lock().is_empty());
        assert!(!fixture.coordinator.is_running());
    }

    #[test]
    fn reads_are_not_blocked_by_an_open_directory_transaction() {
        let fixture = fixture();
        let first = write_track(&fixture.music, "a/01.mp3", "title=One\nartist=A\nalbum=Alpha");
        let second = write_track(&fixture.music, "a/02.mp3", "title=Two\nartist=A\nalbum=Alpha");
        run_scan(&fixture, false);
        fs::write(&first, "title=Uno\nartist=Z\nalbum=Alpha").unwrap();
        fs::write(&second, "title=Dos\nartist=A\nalbum=Alpha").unwrap();

        let (reader, entered, gate_tx) = gate_reader();
        let coordinator = coordinator_over(&fixture, reader);
        let (listener, _) = recorder();
        assert!(coordinator.start(vec![fixture.music.clone()], false, listener));
        // Let the first file through so the directory transaction holds a write.
        entered.recv().unwrap();
        gate_tx.send(()).unwrap();
        entered.recv().unwrap();

        let started = Instant::now();
        let names: Vec<_> = fixture
            .store
            .list_artists()
            .unwrap()
            .into_iter()
            .map(|artist| artist.name)
            .collect();
        let track = fixture.store.find_track_by_path(&path_key(&first)).unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(names, vec!["A"]);
        assert_eq!(track.title.as_deref(), Some("One"));

        drop(gate_tx);
        assert_eq!(coordinator.wait().unwrap().outcome, ScanOutcome::Completed);
        let track = fixture.store.find_track_by_path(&path_key(&first)).unwrap().unwrap();
        assert_eq!(track.title.as_deref(), Some("Uno"));
        assert_eq!(fixture.store.list_artists().unwrap().len(), 2);
    }

    #[test]
    fn stop_while_counting_cancels_before_any_work() {
        let fixture = fixture();
        for n in 1..=3 {
            write_track(&fixture.music, &format!("a/0{}.mp3", n), &format!("title=T{}", n));
        }
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = fixture.coordinator.clone();
        let listener: Arc<dyn ProgressListener> = Arc::new(move |progress: &ScanProgress| {
            if progress.message == "Calculating total files..." {
                assert!(handle.stop());
            }
            sink.lock().push(progress.clone());
        });

        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], true, listener));
        let summary = fixture.coordinator.wait().unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert_eq!(summary.processed, 0);
        let events = events.lock().clone();
        assert_well_formed(&events);
        assert!(events.last().unwrap().message.starts_with("Scan cancelled: "));
        assert_eq!(fixture.store.stats().unwrap().tracks, 0);
    }

    #[test]
    fn stop_right_after_start_is_not_lost() {
        let (reader, _entered, gate_tx) = gate_reader();
        let fixture = fixture_with(reader, 10);
        for n in 1..=3 {
            write_track(&fixture.music, &format!("a/0{}.mp3", n), &format!("title=T{}", n));
        }
        let (listener, events) = recorder();
        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], false, listener));
        assert!(fixture.coordinator.stop());
        assert!(fixture.coordinator.inner.cancel.load(Ordering::SeqCst));

        drop(gate_tx);
        let summary = fixture.coordinator.wait().unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert!(summary.processed <= 1);
        assert_eq!(events.lock().iter().filter(|event| event.done).count(), 1);

        let (summary, _) = run_scan(&fixture, false);
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(fixture.store.stats().unwrap().tracks, 3);
    }

    #[test]
    fn losing_the_database_fails_the_scan() {
        let fixture = fixture();
        write_track(&fixture.music, "a/01.mp3", "title=One");
        fs::remove_dir_all(fixture._dir.path().join("data")).unwrap();

        let (summary, events) = run_scan(&fixture, false);
        assert!(matches!(summary.outcome, ScanOutcome::Failed(_)));
        assert_well_formed(&events);
        assert!(events.last().unwrap().message.starts_with("Scan failed: "));
        let status = fixture.coordinator.status();
        assert_eq!(status.phase, ScanPhase::Idle);
        assert!(status.message.starts_with("Scan failed: "));
    }

    #[test]
    fn full_rescan_prunes_files_deleted_mid_scan() {
        let fixture = fixture();
        let first = write_track(&fixture.music, "a/01.mp3", "title=One\nalbum=Alpha");
        let doomed = write_track(&fixture.music, "a/02.mp3", "title=Two\nalbum=Alpha");
        run_scan(&fixture, false);
        fs::write(&first, "title=Uno\nalbum=Alpha").unwrap();

        let (reader, entered, gate_tx) = gate_reader();
        let coordinator = coordinator_over(&fixture, reader);
        let (listener, _) = recorder();
        assert!(coordinator.start(vec![fixture.music.clone()], true, listener));
        entered.recv().unwrap();
        fs::remove_file(&doomed).unwrap();
        drop(gate_tx);

        let summary = coordinator.wait().unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pruned, 1);
        assert!(fixture.store.find_track_by_path(&path_key(&doomed)).unwrap().is_none());
        assert!(fixture.store.find_track_by_path(&path_key(&first)).unwrap().is_some());
    }

    #[test]
    fn terminal_event_arrives_after_the_scan_is_idle() {
        let fixture = fixture();
        write_track(&fixture.music, "a/01.mp3", "title=One");
        let seen_phase = Arc::new(Mutex::new(None));
        let restarted = Arc::new(Mutex::new(None));
        let (next_listener, next_events) = recorder();
        let handle = fixture.coordinator.clone();
        let folders = vec![fixture.music.clone()];
        let phase_sink = Arc::clone(&seen_phase);
        let restart_sink = Arc::clone(&restarted);
        let listener: Arc<dyn ProgressListener> = Arc::new(move |progress: &ScanProgress| {
            if progress.done {
                *phase_sink.lock() = Some(handle.status().phase);
                let accepted = handle.start(folders.clone(), false, Arc::clone(&next_listener));
                *restart_sink.lock() = Some(accepted);
            }
        });

        assert!(fixture
            .coordinator
            .start(vec![fixture.music.clone()], false, listener));
        fixture.coordinator.wait();
        let summary = fixture.coordinator.wait().unwrap();
        assert_eq!(*seen_phase.lock(), Some(ScanPhase::Idle));
        assert_eq!(*restarted.lock(), Some(true));
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.changed, 0);
        assert_well_formed(&next_events.lock());
    }

    #[test]
    fn stop_when_idle_is_ignored() {
        let fixture = fixture();
        assert!(!fixture.coordinator.stop());
        assert_eq!(fixture.coordinator.status().phase, ScanPhase::Idle);
        assert_eq!(fixture.coordinator.wait(), None);
    }
}
