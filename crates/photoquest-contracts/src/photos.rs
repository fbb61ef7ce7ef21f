use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::now_utc_iso;
use crate::verdict::Verdict;

/// Persisted record of an uploaded photo, derived from the verdict that judged it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedPhoto {
    pub id: String,
    pub challenge_id: Option<String>,
    pub participant: String,
    pub image_path: String,
    pub image_sha256: Option<String>,
    pub approved: bool,
    pub confidence: f64,
    pub explanation: String,
    pub suggested_improvements: Option<String>,
    pub in_gallery: bool,
    pub uploaded_at: String,
}

impl UploadedPhoto {
    pub fn from_verdict(
        challenge_id: Option<&str>,
        participant: &str,
        image_path: &Path,
        image_sha256: Option<&str>,
        verdict: &Verdict,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            challenge_id: challenge_id.map(str::to_string),
            participant: participant.to_string(),
            image_path: image_path.display().to_string(),
            image_sha256: image_sha256.map(str::to_string),
            approved: verdict.is_valid(),
            confidence: verdict.confidence(),
            explanation: verdict.explanation().to_string(),
            suggested_improvements: verdict.suggested_improvements().map(str::to_string),
            in_gallery: verdict.is_valid(),
            uploaded_at: now_utc_iso(),
        }
    }
}

pub trait PhotoStore: Send + Sync {
    fn insert(&self, photo: &UploadedPhoto) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPhotoStore {
    photos: Mutex<Vec<UploadedPhoto>>,
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn photos(&self) -> Vec<UploadedPhoto> {
        self.photos
            .lock()
            .map(|photos| photos.clone())
            .unwrap_or_default()
    }
}

impl PhotoStore for MemoryPhotoStore {
    fn insert(&self, photo: &UploadedPhoto) -> anyhow::Result<()> {
        self.photos
            .lock()
            .map_err(|_| anyhow::anyhow!("photo store lock poisoned"))?
            .push(photo.clone());
        Ok(())
    }
}

/// Append-only `photos.jsonl` log, one record per line.
#[derive(Debug)]
pub struct JsonlPhotoLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlPhotoLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> anyhow::Result<Vec<UploadedPhoto>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
            .collect()
    }
}

impl PhotoStore for JsonlPhotoLog {
    fn insert(&self, photo: &UploadedPhoto) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(photo)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("photo log lock poisoned"))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
