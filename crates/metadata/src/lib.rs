use std::path::Path;

use lofty::error::LoftyError;
use lofty::file::TaggedFile;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::Tag;

/// Normalized tag set for one audio file. Text fields are trimmed and never empty.
#[derive(Debug, Default, Clone)]
pub struct TagSet {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub duration_secs: f64,
    pub art: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Unreadable(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Unreadable(reason) => write!(f, "unreadable: {}", reason),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Boundary to whatever extracts tags from audio files. An `Err` means the
/// file is unreadable; implementations must not panic on corrupt input.
pub trait MetadataReader: Send + Sync {
    fn extract(&self, path: &Path) -> Result<TagSet, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyReader;

impl MetadataReader for LoftyReader {
    fn extract(&self, path: &Path) -> Result<TagSet, MetadataError> {
        read_tags(path)
    }
}

type ArtExtractor = fn(&TaggedFile) -> Option<&Picture>;

// Tried in order; the first one that yields non-empty picture data wins.
const ART_EXTRACTORS: &[(&str, ArtExtractor)] = &[
    ("front cover", front_cover_picture),
    ("primary tag", primary_tag_picture),
    ("any tag", any_tag_picture),
];

pub fn read_tags(path: &Path) -> Result<TagSet, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagSet {
        duration_secs: properties.duration().as_secs_f64(),
        ..TagSet::default()
    };

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag_text(tag, &ItemKey::TrackTitle);
        info.artist = tag_text(tag, &ItemKey::TrackArtist);
        info.album_artist = tag_text(tag, &ItemKey::AlbumArtist);
        info.album = tag_text(tag, &ItemKey::AlbumTitle);
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
        info.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
        info.genre = tag_text(tag, &ItemKey::Genre);
        info.year = [ItemKey::Year, ItemKey::RecordingDate, ItemKey::OriginalReleaseDate]
            .iter()
            .find_map(|key| tag.get_string(key).and_then(parse_year));
    }

    info.art = extract_art(&tagged_file);
    Ok(info)
}

pub fn extract_art(tagged_file: &TaggedFile) -> Option<Vec<u8>> {
    ART_EXTRACTORS.iter().find_map(|(_, extractor)| {
        extractor(tagged_file)
            .filter(|picture| !picture.data().is_empty())
            .map(|picture| picture.data().to_vec())
    })
}

fn front_cover_picture(file: &TaggedFile) -> Option<&Picture> {
    file.tags()
        .iter()
        .flat_map(Tag::pictures)
        .find(|picture| picture.pic_type() == PictureType::CoverFront)
}

fn primary_tag_picture(file: &TaggedFile) -> Option<&Picture> {
    file.primary_tag().and_then(|tag| tag.pictures().first())
}

fn any_tag_picture(file: &TaggedFile) -> Option<&Picture> {
    file.tags().iter().flat_map(Tag::pictures).next()
}

fn tag_text(tag: &Tag, key: &ItemKey) -> Option<String> {
    tag.get_string(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

/// Year from a date tag: the first four characters, when they are all digits.
fn parse_year(text: &str) -> Option<i32> {
    let head: String = text.trim().chars().take(4).collect();
    if head.len() == 4 && head.chars().all(|c| c.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}
