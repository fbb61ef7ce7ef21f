use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use photoquest_contracts::VerificationError;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Image bytes ready for an inline model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub mime_type: &'static str,
    pub byte_len: usize,
    pub sha256: String,
}

impl EncodedImage {
    /// Gemini `inlineData` part.
    pub fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": self.data,
            }
        })
    }
}

/// Reads `path` and base64-encodes it. The file is never modified.
pub fn encode_image(path: &Path) -> Result<EncodedImage, VerificationError> {
    let bytes = fs::read(path).map_err(|err| {
        VerificationError::io(format!("failed reading {}: {err}", path.display()))
    })?;
    Ok(EncodedImage {
        data: BASE64.encode(&bytes),
        mime_type: mime_for_path(path),
        byte_len: bytes.len(),
        sha256: hex::encode(Sha256::digest(&bytes)),
    })
}

/// MIME type from the file extension alone; unknown extensions are sent as JPEG.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        _ => "image/jpeg",
    }
}
