use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::config::config_path_from_env;
use library::{Library, ProgressListener, ScanProgress};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: library <command>
  scan [--full]            index the configured music folders
  artists                  list artists
  albums [artist_id]       list albums, optionally for one artist
  tracks <album_id>        list an album's tracks
  track <path>             show one indexed track
  errors                   list files that could not be read
  folders                  list configured music folders
  folders add <path>       add a music folder
  folders remove <path>    remove a music folder
  stats                    show row counts";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config_path = config_path_from_env();
    let mut library = Library::open(&config_path)?;

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["scan"] => scan(&library, false),
        ["scan", "--full"] => scan(&library, true),
        ["artists"] => print_json(&library.list_artists()?),
        ["albums"] => print_json(&library.list_albums(None)?),
        ["albums", artist_id] => print_json(&library.list_albums(Some(artist_id.parse()?))?),
        ["tracks", album_id] => print_json(&library.list_tracks(album_id.parse()?)?),
        ["track", path] => print_json(&library.find_track_by_path(path)?),
        ["errors"] => print_json(&library.list_scan_errors()?),
        ["stats"] => print_json(&library.stats()?),
        ["folders"] => print_json(&library.music_folders()),
        ["folders", "add", path] => {
            if !library.add_music_folder(&PathBuf::from(path))? {
                info!("{} is already configured", path);
            }
            print_json(&library.music_folders())
        }
        ["folders", "remove", path] => {
            if !library.remove_music_folder(&PathBuf::from(path))? {
                info!("{} was not configured", path);
            }
            print_json(&library.music_folders())
        }
        _ => Err(USAGE.into()),
    }
}

fn scan(library: &Library, full_rescan: bool) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = library.scanner().clone();
    ctrlc::set_handler(move || {
        if scanner.stop() {
            eprintln!("Stopping scan...");
        }
    })?;

    let listener: Arc<dyn ProgressListener> = Arc::new(|progress: &ScanProgress| {
        info!("[{:>3.0}%] {}", progress.fraction * 100.0, progress.message);
    });
    if !library.start_scan(full_rescan, listener) {
        return Err("a scan is already running".into());
    }
    let summary = library
        .scanner()
        .wait()
        .ok_or("scan finished without a summary")?;
    print_json(&summary)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
