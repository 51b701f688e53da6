use axum::extract::Multipart;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;

use crate::errors::ApiError;

/// Multipart field the image must be sent in.
pub const FILE_FIELD: &str = "file";

/// Image formats accepted by `/analyze-emotion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    Jpeg,
    Png,
    Bmp,
    Tiff,
    WebP,
}

impl SupportedFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/tiff" => Some(Self::Tiff),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        mime_guess::from_path(name)
            .iter()
            .find_map(|mime| Self::from_mime(mime.essence_str()))
    }

    /// The declared media type decides; the file extension is only consulted
    /// when nothing specific was declared.
    pub fn resolve(declared: Option<&str>, file_name: Option<&str>) -> Option<Self> {
        match declared.map(str::trim) {
            Some(mime) if !mime.is_empty() && !is_generic(mime) => Self::from_mime(mime),
            _ => file_name.and_then(Self::from_file_name),
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Bmp => ImageFormat::Bmp,
            Self::Tiff => ImageFormat::Tiff,
            Self::WebP => ImageFormat::WebP,
        }
    }
}

fn is_generic(mime: &str) -> bool {
    mime.split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/octet-stream"))
}

/// A single uploaded image, held in memory for the duration of one request.
#[derive(Debug)]
pub struct Upload {
    pub file_name: Option<String>,
    pub format: SupportedFormat,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn decode(&self) -> Result<DynamicImage, ApiError> {
        let mut reader = ImageReader::new(Cursor::new(&self.bytes))
            .with_guessed_format()
            .map_err(|e| ApiError::InvalidImage {
                reason: e.to_string(),
            })?;
        if reader.format().is_none() {
            reader.set_format(self.format.image_format());
        }
        reader.decode().map_err(|e| ApiError::InvalidImage {
            reason: e.to_string(),
        })
    }
}

/// Pulls the `file` field out of a multipart body.
///
/// Format is checked from the part headers before any bytes are read, and
/// the body is streamed so oversized uploads are rejected without being
/// buffered in full.
pub async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<Upload, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        tracing::debug!(error = %e, "Failed to parse multipart data");
        ApiError::MissingFile
    })? {
        if field.name() != Some(FILE_FIELD) {
            tracing::trace!(field = ?field.name(), "Skipping multipart field");
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let declared = field.content_type().map(str::to_string);
        let format = SupportedFormat::resolve(declared.as_deref(), file_name.as_deref())
            .ok_or_else(|| ApiError::UnsupportedFormat {
                declared: declared.clone().or_else(|| file_name.clone()),
            })?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| ApiError::InvalidImage {
            reason: format!("Failed to read file chunk: {e}"),
        })? {
            if bytes.len() + chunk.len() > max_bytes {
                tracing::warn!(
                    received = bytes.len() + chunk.len(),
                    max_bytes,
                    "File size limit exceeded, aborting upload"
                );
                return Err(ApiError::FileTooLarge { limit: max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        return Ok(Upload {
            file_name,
            format,
            bytes,
        });
    }

    Err(ApiError::MissingFile)
}
