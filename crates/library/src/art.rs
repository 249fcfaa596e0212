use std::fs;
use std::io::Cursor;
use std::path::PathBuf;

use common::{sanitize_for_cache, short_hash};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageFormat};
use tracing::{debug, warn};

const NAME_HASH_LEN: usize = 16;
const ART_EXTENSIONS: &[&str] = &["jpg", "png"];

/// Content-addressed album thumbnails. The file name depends only on the
/// album identity, so caching the same album twice is a no-op.
#[derive(Clone, Debug)]
pub struct ArtCache {
    dir: PathBuf,
    max_dim: u32,
    quality: u8,
}

impl ArtCache {
    pub fn new(dir: PathBuf, max_dim: u32, quality: u8) -> Self {
        Self {
            dir,
            max_dim: max_dim.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Writes a thumbnail for the album and returns its file name, or `None`
    /// when the bytes are empty or cannot be turned into an image.
    pub fn cache(&self, raw: &[u8], album_id: i64, album_name: &str) -> Option<String> {
        if raw.is_empty() {
            return None;
        }
        let stem = art_stem(album_id, album_name);
        if let Some(existing) = self.existing(&stem) {
            debug!("Reusing cached art {}", existing);
            return Some(existing);
        }

        let decoded = match image::load_from_memory(raw) {
            Ok(image) => image,
            Err(err) => {
                warn!("Failed to decode art for album {} ({}): {}", album_id, album_name, err);
                return None;
            }
        };
        let thumb = self.shrink(decoded);

        let (bytes, ext) = match encode_jpeg(&thumb, self.quality) {
            Ok(bytes) => (bytes, "jpg"),
            Err(err) => {
                debug!("JPEG encoding failed for album {}: {}; trying PNG", album_id, err);
                match encode_png(&thumb) {
                    Ok(bytes) => (bytes, "png"),
                    Err(err) => {
                        warn!("Failed to encode art for album {}: {}", album_id, err);
                        return None;
                    }
                }
            }
        };

        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create art dir {:?}: {}", self.dir, err);
            return None;
        }
        let filename = format!("{}.{}", stem, ext);
        let target = self.dir.join(&filename);
        let partial = self.dir.join(format!("{}.part", filename));
        let written = fs::write(&partial, &bytes).and_then(|_| fs::rename(&partial, &target));
        if let Err(err) = written {
            warn!("Failed to write art {:?}: {}", target, err);
            let _ = fs::remove_file(&partial);
            return None;
        }
        Some(filename)
    }

    fn existing(&self, stem: &str) -> Option<String> {
        ART_EXTENSIONS
            .iter()
            .map(|ext| format!("{}.{}", stem, ext))
            .find(|name| self.dir.join(name).is_file())
    }

    // Never upscales; aspect ratio is kept.
    fn shrink(&self, image: DynamicImage) -> DynamicImage {
        if image.width() <= self.max_dim && image.height() <= self.max_dim {
            image
        } else {
            image.thumbnail(self.max_dim, self.max_dim)
        }
    }
}

pub fn art_stem(album_id: i64, album_name: &str) -> String {
    let key = format!("{}_{}", album_id, sanitize_for_cache(album_name));
    format!("art_{}", short_hash(&key, NAME_HASH_LEN))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

fn encode_png(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
