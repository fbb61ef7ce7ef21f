//! Call-site policies. Challenge uploads are fail-closed; gallery uploads are permissive.
//!
//! The two are separate types on purpose: nothing on the gallery path can reach the challenge
//! verdict logic, so loosening one cannot loosen the other.

use std::path::Path;
use std::sync::Arc;

use photoquest_contracts::events::{emit_best_effort, EventPayload, EventSink};
use photoquest_contracts::Verdict;
use serde_json::Value;

use crate::client::{VerificationClient, VerificationRequest, Verifier};
use crate::retry::{CancelFlag, RetryOutcome, RetryPolicy};

pub const DEFAULT_GALLERY_SCORE: f64 = 0.8;
pub const FALLBACK_CAPTION: &str = "A moment from the wedding celebration.";

pub struct ChallengeVerificationPolicy {
    verifier: Arc<dyn Verifier>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl ChallengeVerificationPolicy {
    pub fn new(verifier: Arc<dyn Verifier>, retry: RetryPolicy, events: Arc<dyn EventSink>) -> Self {
        Self {
            verifier,
            retry,
            events,
        }
    }

    pub fn verify_photo_for_challenge(
        &self,
        image_path: &Path,
        challenge_title: &str,
        challenge_description: &str,
    ) -> Verdict {
        let request = VerificationRequest::new(image_path, challenge_title, challenge_description);
        self.verify(&request, &CancelFlag::new()).verdict
    }

    pub fn verify(&self, request: &VerificationRequest, cancel: &CancelFlag) -> RetryOutcome {
        self.retry
            .run(self.verifier.as_ref(), request, cancel, self.events.as_ref())
    }
}

/// Outcome of a non-challenge gallery upload.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryAssessment {
    pub approved: bool,
    pub score: f64,
    pub caption: String,
    pub caption_from_model: bool,
}

pub struct GalleryAnalysisPolicy {
    client: Arc<VerificationClient>,
    events: Arc<dyn EventSink>,
    default_score: f64,
}

impl GalleryAnalysisPolicy {
    pub fn new(client: Arc<VerificationClient>, events: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            events,
            default_score: DEFAULT_GALLERY_SCORE,
        }
    }

    /// Best-effort caption; any failure yields [`FALLBACK_CAPTION`].
    pub fn analyze_photo_content(&self, image_path: &Path) -> String {
        self.caption(image_path).0
    }

    /// Gallery uploads are always approved with the fixed default score.
    pub fn assess(&self, image_path: &Path) -> GalleryAssessment {
        let (caption, caption_from_model) = self.caption(image_path);
        GalleryAssessment {
            approved: true,
            score: self.default_score,
            caption,
            caption_from_model,
        }
    }

    fn caption(&self, image_path: &Path) -> (String, bool) {
        let mut payload = EventPayload::new();
        payload.insert(
            "image_path".to_string(),
            Value::from(image_path.display().to_string()),
        );
        let result = match self.client.describe(image_path) {
            Ok(caption) => (caption, true),
            Err(err) => {
                payload.insert("error_kind".to_string(), Value::from(err.kind().as_str()));
                payload.insert("error".to_string(), Value::from(err.message()));
                (FALLBACK_CAPTION.to_string(), false)
            }
        };
        payload.insert("caption_from_model".to_string(), Value::Bool(result.1));
        emit_best_effort(self.events.as_ref(), "gallery_analysis", payload);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use photoquest_contracts::events::MemoryEventSink;
    use photoquest_contracts::VerificationError;

    use super::{
        ChallengeVerificationPolicy, GalleryAnalysisPolicy, DEFAULT_GALLERY_SCORE,
        FALLBACK_CAPTION,
    };
    use crate::client::tests::ScriptedProvider;
    use crate::client::VerificationClient;
    use crate::config::VerifierConfig;
    use crate::retry::tests::{RecordingPause, ScriptedVerifier};
    use crate::retry::RetryPolicy;

    fn gallery_with(
        replies: Vec<anyhow::Result<String>>,
    ) -> (GalleryAnalysisPolicy, Arc<MemoryEventSink>) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let client = Arc::new(VerificationClient::new(provider, &VerifierConfig::default()));
        let events = Arc::new(MemoryEventSink::new("gallery"));
        (GalleryAnalysisPolicy::new(client, events.clone()), events)
    }

    #[test]
    fn gallery_uses_model_caption_when_available() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = temp.path().join("dance.png");
        fs::write(&photo, b"png")?;
        let (policy, events) = gallery_with(vec![Ok("Guests dancing.".to_string())]);

        let assessment = policy.assess(&photo);
        assert!(assessment.approved);
        assert_eq!(assessment.score, DEFAULT_GALLERY_SCORE);
        assert_eq!(assessment.caption, "Guests dancing.");
        assert!(assessment.caption_from_model);
        assert_eq!(events.events_of_type("gallery_analysis").len(), 1);
        Ok(())
    }

    #[test]
    fn gallery_approves_with_fallback_caption_on_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = temp.path().join("dance.png");
        fs::write(&photo, b"png")?;
        let (policy, events) =
            gallery_with(vec![Err(VerificationError::timeout("deadline").into())]);

        let assessment = policy.assess(&photo);
        assert!(assessment.approved);
        assert_eq!(assessment.caption, FALLBACK_CAPTION);
        assert!(!assessment.caption_from_model);
        assert_eq!(
            events.events_of_type("gallery_analysis")[0]["error_kind"],
            "timeout"
        );
        Ok(())
    }

    #[test]
    fn analyze_photo_content_never_fails_on_missing_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (policy, _) = gallery_with(Vec::new());
        assert_eq!(
            policy.analyze_photo_content(&temp.path().join("missing.jpg")),
            FALLBACK_CAPTION
        );
        Ok(())
    }

    #[test]
    fn challenge_policy_is_fail_closed() {
        let verifier = Arc::new(ScriptedVerifier::new(vec![
            Err(VerificationError::parse("a")),
            Err(VerificationError::parse("b")),
            Err(VerificationError::parse("c")),
        ]));
        let retry = RetryPolicy::new(2, Duration::from_millis(2000))
            .with_pause(Arc::new(RecordingPause::default()));
        let policy = ChallengeVerificationPolicy::new(
            verifier.clone(),
            retry,
            Arc::new(MemoryEventSink::new("challenge")),
        );
        let verdict = policy.verify_photo_for_challenge(
            std::path::Path::new("/uploads/x.jpg"),
            "Toast",
            "Raise a glass",
        );
        assert!(!verdict.is_valid());
        assert_eq!(verdict.confidence(), 0.0);
        assert_eq!(verifier.calls(), 3);
    }
}
