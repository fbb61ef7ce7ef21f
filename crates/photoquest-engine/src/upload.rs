use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use photoquest_contracts::events::{emit_best_effort, EventPayload, EventSink};
use photoquest_contracts::limits::RateLimiter;
use photoquest_contracts::photos::{PhotoStore, UploadedPhoto};
use photoquest_contracts::progress::{ChallengeProgress, ProgressLedger, ProgressUpdate};
use photoquest_contracts::Verdict;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::client::VerificationRequest;
use crate::policy::ChallengeVerificationPolicy;
use crate::retry::CancelFlag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeUpload {
    pub challenge_id: String,
    pub participant: String,
    pub request: VerificationRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Completed {
        verdict: Verdict,
        progress: ChallengeProgress,
        photo: UploadedPhoto,
    },
    Rejected {
        verdict: Verdict,
        progress: ChallengeProgress,
        photo: Option<UploadedPhoto>,
    },
}

impl UploadOutcome {
    pub fn verdict(&self) -> &Verdict {
        match self {
            Self::Completed { verdict, .. } | Self::Rejected { verdict, .. } => verdict,
        }
    }

    pub fn progress(&self) -> &ChallengeProgress {
        match self {
            Self::Completed { progress, .. } | Self::Rejected { progress, .. } => progress,
        }
    }
}

#[derive(Debug)]
pub enum UploadError {
    RateLimited { participant: String },
    /// The challenge was already completed by this participant.
    AlreadyCompleted { progress: ChallengeProgress },
    Storage(anyhow::Error),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { participant } => {
                write!(f, "too many uploads from '{participant}', try again later")
            }
            Self::AlreadyCompleted { progress } => write!(
                f,
                "challenge '{}' is already completed for '{}'",
                progress.challenge_id, progress.participant
            ),
            Self::Storage(err) => write!(f, "progress storage failed: {err:#}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(&**err),
            _ => None,
        }
    }
}

/// Handles one challenge upload end to end: admission, verification, progress, photo record.
pub struct ChallengeUploadService {
    policy: ChallengeVerificationPolicy,
    ledger: Arc<dyn ProgressLedger>,
    photos: Arc<dyn PhotoStore>,
    limiter: Arc<dyn RateLimiter>,
    events: Arc<dyn EventSink>,
    persist_rejected: bool,
}

impl ChallengeUploadService {
    pub fn new(
        policy: ChallengeVerificationPolicy,
        ledger: Arc<dyn ProgressLedger>,
        photos: Arc<dyn PhotoStore>,
        limiter: Arc<dyn RateLimiter>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            policy,
            ledger,
            photos,
            limiter,
            events,
            persist_rejected: false,
        }
    }

    /// Also store photos that failed verification (kept out of the gallery).
    pub fn persist_rejected(mut self, enabled: bool) -> Self {
        self.persist_rejected = enabled;
        self
    }

    pub fn handle(
        &self,
        upload: &ChallengeUpload,
        cancel: &CancelFlag,
    ) -> Result<UploadOutcome, UploadError> {
        if !self.limiter.allow(&upload.participant) {
            self.emit("upload_rate_limited", upload, EventPayload::new());
            return Err(UploadError::RateLimited {
                participant: upload.participant.clone(),
            });
        }

        let progress = self
            .ledger
            .get_or_create(&upload.challenge_id, &upload.participant)
            .map_err(UploadError::Storage)?;

        let verdict = self.policy.verify(&upload.request, cancel).verdict;

        // Rejections on a completed record are still counted; completion is left as is.
        if !verdict.is_valid() {
            let update = self
                .ledger
                .record_attempt(&progress.id, false)
                .map_err(UploadError::Storage)?;
            let progress = update.progress().clone();
            let photo = if self.persist_rejected {
                let photo = self.photo_record(upload, &verdict);
                self.photos.insert(&photo).map_err(UploadError::Storage)?;
                Some(photo)
            } else {
                None
            };
            let mut payload = EventPayload::new();
            payload.insert(
                "photos_uploaded".to_string(),
                Value::from(progress.photos_uploaded),
            );
            payload.insert("fallback".to_string(), Value::Bool(verdict.is_fallback()));
            self.emit("upload_rejected", upload, payload);
            return Ok(UploadOutcome::Rejected {
                verdict,
                progress,
                photo,
            });
        }

        if progress.is_completed {
            return Err(self.conflict(upload, progress));
        }
        let progress = match self
            .ledger
            .record_attempt(&progress.id, true)
            .map_err(UploadError::Storage)?
        {
            ProgressUpdate::Applied(progress) => progress,
            ProgressUpdate::AlreadyCompleted(progress) => {
                return Err(self.conflict(upload, progress))
            }
        };

        let photo = self.photo_record(upload, &verdict);
        if let Err(err) = self.photos.insert(&photo) {
            if let Err(revert_err) = self.ledger.revert_completion(&progress.id) {
                return Err(UploadError::Storage(err.context(format!(
                    "completion of {} could not be reverted: {revert_err:#}",
                    progress.id
                ))));
            }
            return Err(UploadError::Storage(err));
        }
        let mut payload = EventPayload::new();
        payload.insert("photo_id".to_string(), Value::from(photo.id.clone()));
        payload.insert("confidence".to_string(), Value::from(verdict.confidence()));
        self.emit("upload_completed", upload, payload);
        Ok(UploadOutcome::Completed {
            verdict,
            progress,
            photo,
        })
    }

    fn conflict(&self, upload: &ChallengeUpload, progress: ChallengeProgress) -> UploadError {
        self.emit("upload_conflict", upload, EventPayload::new());
        UploadError::AlreadyCompleted { progress }
    }

    fn photo_record(&self, upload: &ChallengeUpload, verdict: &Verdict) -> UploadedPhoto {
        let path = &upload.request.image_path;
        UploadedPhoto::from_verdict(
            Some(&upload.challenge_id),
            &upload.participant,
            path,
            file_sha256(path).as_deref(),
            verdict,
        )
    }

    fn emit(&self, event_type: &str, upload: &ChallengeUpload, mut payload: EventPayload) {
        payload.insert(
            "challenge_id".to_string(),
            Value::from(upload.challenge_id.clone()),
        );
        payload.insert(
            "participant".to_string(),
            Value::from(upload.participant.clone()),
        );
        emit_best_effort(self.events.as_ref(), event_type, payload);
    }
}

fn file_sha256(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}
