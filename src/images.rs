use crate::models::ImageRecord;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::{GenericImageView, codecs::jpeg::JpegEncoder, imageops::FilterType};
use reqwest::Client;
use std::{fmt, io::Cursor};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_DIMENSION: u32 = 1600;
pub const JPEG_QUALITY: u8 = 80;
pub const MAX_PERSIST_IMAGES: usize = 20;

const FALLBACK_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("invalid image payload: {0}")]
    Payload(String),
    #[error("image download failed: {0}")]
    Download(String),
    #[error("position {index} is out of range for {len} images")]
    OutOfRange { index: usize, len: usize },
}

/// Encoded photo held in memory until it is uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl fmt::Debug for StagedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedImage")
            .field("bytes", &self.bytes.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl StagedImage {
    /// File extension taken from the content type (`image/png` → `png`).
    pub fn extension(&self) -> &str {
        self.content_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .filter(|subtype| !subtype.is_empty())
            .unwrap_or("jpeg")
    }

    /// Accepts either a `data:<mime>;base64,<payload>` URL or bare base64.
    pub fn decode_payload(payload: &str) -> Result<(Vec<u8>, Option<String>), ImageError> {
        let trimmed = payload.trim();
        let (mime, data) = match trimmed.strip_prefix("data:") {
            Some(rest) => {
                let (meta, data) = rest
                    .split_once(',')
                    .ok_or_else(|| ImageError::Payload("data url without payload".into()))?;
                let mime = meta
                    .strip_suffix(";base64")
                    .filter(|mime| !mime.is_empty())
                    .map(str::to_string);
                (mime, data)
            }
            None => (None, trimmed),
        };
        let bytes = BASE64
            .decode(data)
            .map_err(|err| ImageError::Payload(err.to_string()))?;
        Ok((bytes, mime))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            max_width: MAX_DIMENSION,
            max_height: MAX_DIMENSION,
            quality: JPEG_QUALITY,
        }
    }
}

/// Where a selected photo comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    Url(String),
}

/// `min(max_w / w, max_h / h, 1)`: fits inside the box, never upscales.
pub fn scale_factor(width: u32, height: u32, max_width: u32, max_height: u32) -> f64 {
    if width == 0 || height == 0 {
        return 1.0;
    }
    let by_width = max_width as f64 / width as f64;
    let by_height = max_height as f64 / height as f64;
    by_width.min(by_height).min(1.0)
}

pub fn target_dimensions(width: u32, height: u32, options: &CompressOptions) -> (u32, u32) {
    let ratio = scale_factor(width, height, options.max_width, options.max_height);
    let w = ((width as f64 * ratio).round() as u32).max(1);
    let h = ((height as f64 * ratio).round() as u32).max(1);
    (w, h)
}

/// Decodes, downscales and re-encodes as JPEG.
pub fn compress(bytes: &[u8], options: &CompressOptions) -> Result<StagedImage, ImageError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| ImageError::Decode(err.to_string()))?;
    let (width, height) = decoded.dimensions();
    let (w, h) = target_dimensions(width, height, options);
    let resized = if (w, h) == (width, height) {
        decoded
    } else {
        decoded.resize_exact(w, h, FilterType::Triangle)
    };

    let mut buffer = Vec::new();
    {
        let mut cursor = Cursor::new(&mut buffer);
        let encoder = JpegEncoder::new_with_quality(&mut cursor, options.quality);
        resized
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|err| ImageError::Encode(err.to_string()))?;
    }
    debug!(
        target = "emlak.images",
        from = ?(width, height),
        to = ?(w, h),
        bytes = buffer.len(),
        "image compressed"
    );
    Ok(StagedImage {
        bytes: buffer,
        content_type: FALLBACK_CONTENT_TYPE.to_string(),
    })
}

/// Compresses, or keeps the original content when decoding or encoding fails.
pub fn compress_or_original(
    bytes: Vec<u8>,
    content_type: Option<String>,
    options: &CompressOptions,
) -> StagedImage {
    match compress(&bytes, options) {
        Ok(staged) => staged,
        Err(err) => {
            warn!(target = "emlak.images", error = %err, "compression failed; keeping original");
            let content_type = content_type
                .or_else(|| {
                    image::guess_format(&bytes)
                        .ok()
                        .map(|format| format.to_mime_type().to_string())
                })
                .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
            StagedImage {
                bytes,
                content_type,
            }
        }
    }
}

/// Produces a staged image from a selected file or a remote URL. Only a
/// failed download is an error; codec failures fall back to the raw bytes.
pub async fn stage(
    http: &Client,
    source: ImageSource,
    options: CompressOptions,
) -> Result<StagedImage, ImageError> {
    let (bytes, content_type) = match source {
        ImageSource::Bytes {
            bytes,
            content_type,
        } => (bytes, content_type),
        ImageSource::Url(url) => download(http, &url).await?,
    };
    tokio::task::spawn_blocking(move || compress_or_original(bytes, content_type, &options))
        .await
        .map_err(|err| ImageError::Encode(err.to_string()))
}

/// Stages every source in selection order.
pub async fn stage_all(
    http: &Client,
    sources: Vec<ImageSource>,
    options: CompressOptions,
) -> Result<Vec<StagedImage>, ImageError> {
    let mut staged = Vec::with_capacity(sources.len());
    for source in sources {
        staged.push(stage(http, source, options).await?);
    }
    Ok(staged)
}

async fn download(http: &Client, url: &str) -> Result<(Vec<u8>, Option<String>), ImageError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| ImageError::Download(err.to_string()))?;
    if !response.status().is_success() {
        return Err(ImageError::Download(format!("HTTP {}", response.status())));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ImageError::Download(err.to_string()))?;
    Ok((bytes.to_vec(), content_type))
}

/// One entry of the photo order shown to an editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSlot {
    Persisted { id: Uuid, url: String },
    Staged(StagedImage),
}

/// Editable photo order. Position 0 is the cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageOrder {
    slots: Vec<ImageSlot>,
    pending_deletions: Vec<Uuid>,
}

/// Photo order frozen for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePlan {
    pub slots: Vec<ImageSlot>,
    pub deletions: Vec<Uuid>,
}

impl ImageOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit mode: starts from the stored photos in `idx` order.
    pub fn from_persisted(mut records: Vec<ImageRecord>) -> Self {
        records.sort_by_key(|record| record.idx);
        let mut order = Self::new();
        for record in records {
            let duplicate = order.slots.iter().any(|slot| {
                matches!(slot, ImageSlot::Persisted { id, .. } if *id == record.id)
            });
            if !duplicate {
                order.slots.push(ImageSlot::Persisted {
                    id: record.id,
                    url: record.url,
                });
            }
        }
        order
    }

    /// Adds photos at the end. Photos already in the order are skipped;
    /// returns how many were added.
    pub fn append(&mut self, images: impl IntoIterator<Item = StagedImage>) -> usize {
        let mut added = 0;
        for image in images {
            let slot = ImageSlot::Staged(image);
            if !self.slots.contains(&slot) {
                self.slots.push(slot);
                added += 1;
            }
        }
        added
    }

    /// Removes the photo at `index`. Stored photos are queued for deletion at
    /// save time; staged ones are simply dropped.
    pub fn remove(&mut self, index: usize) -> Result<ImageSlot, ImageError> {
        self.check(index)?;
        let slot = self.slots.remove(index);
        if let ImageSlot::Persisted { id, .. } = &slot {
            self.pending_deletions.push(*id);
        }
        Ok(slot)
    }

    /// Moves the photo at `index` to the cover position; the others keep
    /// their relative order.
    pub fn promote(&mut self, index: usize) -> Result<(), ImageError> {
        self.check(index)?;
        let slot = self.slots.remove(index);
        self.slots.insert(0, slot);
        Ok(())
    }

    pub fn cover(&self) -> Option<&ImageSlot> {
        self.slots.first()
    }

    pub fn slots(&self) -> &[ImageSlot] {
        &self.slots
    }

    pub fn pending_deletions(&self) -> &[Uuid] {
        &self.pending_deletions
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn staged_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, ImageSlot::Staged(_)))
            .count()
    }

    /// Freezes the order for saving, keeping at most `cap` photos. Stored
    /// photos beyond the cap join the deletions.
    pub fn into_plan(self, cap: usize) -> ImagePlan {
        let mut slots = self.slots;
        let mut deletions = self.pending_deletions;
        if slots.len() > cap {
            for slot in slots.drain(cap..) {
                if let ImageSlot::Persisted { id, .. } = slot {
                    deletions.push(id);
                }
            }
        }
        ImagePlan { slots, deletions }
    }

    fn check(&self, index: usize) -> Result<(), ImageError> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(ImageError::OutOfRange {
                index,
                len: self.slots.len(),
            })
        }
    }
}
