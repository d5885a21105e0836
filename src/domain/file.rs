//! Attachment types.
//!
//! An attachment starts as an [`UploadedFile`] from the caller, becomes an
//! [`AdmittedFile`] once it has passed the attachment policy (and possibly been
//! recompressed), and is recorded as a [`RequestFile`] once its bytes are stored.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::RequestId;

/// Unique identifier for an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl From<Uuid> for FileId {
    fn from(uuid: Uuid) -> Self {
        FileId(uuid)
    }
}

impl std::ops::Deref for FileId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The attachment formats the system accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Png,
    Jpeg,
    Pdf,
}

impl AttachmentKind {
    pub fn is_image(&self) -> bool {
        matches!(self, AttachmentKind::Png | AttachmentKind::Jpeg)
    }

    pub fn default_extension(&self) -> &'static str {
        match self {
            AttachmentKind::Png => "png",
            AttachmentKind::Jpeg => "jpg",
            AttachmentKind::Pdf => "pdf",
        }
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    /// Parse a mime type, ignoring case and parameters (`; charset=...`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim().to_lowercase();
        match essence.as_str() {
            "image/png" => Ok(AttachmentKind::Png),
            "image/jpeg" | "image/jpg" => Ok(AttachmentKind::Jpeg),
            "application/pdf" => Ok(AttachmentKind::Pdf),
            _ => Err(format!("Unsupported mime type: {}", s)),
        }
    }
}

/// A file as received from the caller, before any policy has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A file that passed the attachment policy and is ready to be stored.
///
/// Name and mime type are those of the original upload; the bytes may have
/// been recompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedFile {
    pub file_name: String,
    pub mime_type: String,
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
    pub original_size_bytes: u64,
    pub recompressed: bool,
}

impl AdmittedFile {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Extension for the storage path, taken from the file name when present.
    pub fn extension(&self) -> String {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| self.kind.default_extension().to_string())
    }
}

/// Metadata record of a stored attachment, owned by exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFile {
    pub id: FileId,
    pub request_id: RequestId,
    pub file_name: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}
