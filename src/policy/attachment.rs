//! Attachment admission: type and size validation, then best-effort image
//! recompression.
//!
//! Validation always runs against the original upload. Recompression happens
//! strictly afterwards, so an oversized file can never be shrunk into
//! acceptance. If recompression fails for any reason the validated original is
//! admitted unchanged.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageResult};
use serde::{Deserialize, Serialize};

use crate::domain::file::{AdmittedFile, AttachmentKind, UploadedFile};
use crate::error::PolicyViolation;

pub const MIB: u64 = 1024 * 1024;

/// Images are not shrunk below this edge length while chasing the byte target.
const MIN_DIMENSION: u32 = 64;

/// JPEG qualities tried, in order, at each scale.
const JPEG_QUALITIES: [u8; 4] = [85, 70, 55, 40];

/// Size and dimension limits for attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentLimits {
    /// Largest accepted upload, checked before any recompression
    pub max_upload_bytes: u64,
    /// Size recompression aims for
    pub recompress_target_bytes: u64,
    /// Longest edge allowed after recompression
    pub max_image_dimension: u32,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * MIB,
            recompress_target_bytes: MIB,
            max_image_dimension: 1920,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttachmentPolicy {
    limits: AttachmentLimits,
}

impl AttachmentPolicy {
    pub fn new(limits: AttachmentLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }

    /// Type and size checks only. Cheap; never decodes the file.
    pub fn check(&self, file: &UploadedFile) -> Result<AttachmentKind, PolicyViolation> {
        let kind: AttachmentKind =
            file.mime_type
                .parse()
                .map_err(|_| PolicyViolation::UnsupportedType {
                    mime_type: file.mime_type.clone(),
                })?;

        if file.size_bytes() > self.limits.max_upload_bytes {
            return Err(PolicyViolation::TooLarge {
                size_bytes: file.size_bytes(),
                limit_bytes: self.limits.max_upload_bytes,
            });
        }

        Ok(kind)
    }

    /// Validate `file` and, for images, try to recompress it.
    ///
    /// CPU-bound for large images; async callers should run it on a blocking
    /// thread.
    pub fn admit(&self, file: UploadedFile) -> Result<AdmittedFile, PolicyViolation> {
        let kind = self.check(&file)?;
        let original_size_bytes = file.size_bytes();

        let recompressed = if kind.is_image() {
            match recompress(&file.bytes, kind, &self.limits) {
                Ok(Some(bytes))
                    if bytes.len() as u64 <= self.limits.recompress_target_bytes
                        || (bytes.len() as u64) < original_size_bytes =>
                {
                    Some(bytes)
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(
                        file_name = %file.file_name,
                        size_bytes = original_size_bytes,
                        error = %e,
                        "Image recompression failed, admitting original"
                    );
                    None
                }
            }
        } else {
            None
        };

        let (bytes, recompressed) = match recompressed {
            Some(bytes) => (bytes, true),
            None => (file.bytes, false),
        };

        if recompressed {
            tracing::debug!(
                file_name = %file.file_name,
                original_size_bytes,
                size_bytes = bytes.len(),
                "Recompressed image attachment"
            );
        }

        Ok(AdmittedFile {
            file_name: file.file_name,
            mime_type: file.mime_type,
            kind,
            bytes,
            original_size_bytes,
            recompressed,
        })
    }
}

/// Re-encode an image so it fits the byte and dimension limits.
///
/// Returns `Ok(None)` when the image already fits both. Otherwise returns the
/// smallest encoding produced, which may still exceed the byte target if the
/// image could not be shrunk enough.
fn recompress(
    bytes: &[u8],
    kind: AttachmentKind,
    limits: &AttachmentLimits,
) -> ImageResult<Option<Vec<u8>>> {
    let format = match kind {
        AttachmentKind::Png => ImageFormat::Png,
        AttachmentKind::Jpeg => ImageFormat::Jpeg,
        AttachmentKind::Pdf => return Ok(None),
    };

    let mut image = image::load_from_memory_with_format(bytes, format)?;
    let max_dimension = limits.max_image_dimension;
    let oversized = image.width() > max_dimension || image.height() > max_dimension;

    if !oversized && bytes.len() as u64 <= limits.recompress_target_bytes {
        return Ok(None);
    }

    if oversized {
        image = image.resize(max_dimension, max_dimension, FilterType::Lanczos3);
    }
    if kind == AttachmentKind::Jpeg {
        // JPEG has no alpha channel
        image = DynamicImage::ImageRgb8(image.to_rgb8());
    }

    let qualities: &[u8] = match kind {
        AttachmentKind::Jpeg => &JPEG_QUALITIES,
        _ => &[0],
    };

    let mut best: Option<Vec<u8>> = None;
    loop {
        for &quality in qualities {
            let encoded = encode(&image, kind, quality)?;
            let fits = encoded.len() as u64 <= limits.recompress_target_bytes;
            if best.as_ref().map_or(true, |b| encoded.len() < b.len()) {
                best = Some(encoded);
            }
            if fits {
                return Ok(best);
            }
        }

        let (width, height) = (image.width(), image.height());
        if width.max(height) <= MIN_DIMENSION {
            break;
        }
        image = image.resize(width * 3 / 4, height * 3 / 4, FilterType::Triangle);
    }

    Ok(best)
}

fn encode(image: &DynamicImage, kind: AttachmentKind, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    match kind {
        AttachmentKind::Jpeg => {
            image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?
        }
        _ => image.write_with_encoder(PngEncoder::new_with_quality(
            &mut buf,
            CompressionType::Default,
            PngFilter::Adaptive,
        ))?,
    }
    Ok(buf)
}
