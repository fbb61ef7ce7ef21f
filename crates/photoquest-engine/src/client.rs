use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use photoquest_contracts::sanitize::extract_json;
use photoquest_contracts::verdict::response_schema_hint;
use photoquest_contracts::{validate, VerificationError, Verdict};
use serde_json::Value;

use crate::config::VerifierConfig;
use crate::encoder::encode_image;
use crate::provider::{classify_provider_error, VisionProvider, VisionRequest};

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub image_path: PathBuf,
    pub challenge_title: String,
    pub challenge_description: String,
}

impl VerificationRequest {
    pub fn new(
        image_path: impl Into<PathBuf>,
        challenge_title: impl Into<String>,
        challenge_description: impl Into<String>,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            challenge_title: challenge_title.into(),
            challenge_description: challenge_description.into(),
        }
    }
}

/// A single verification attempt. Implementations must not touch shared state.
pub trait Verifier: Send + Sync {
    fn verify(&self, request: &VerificationRequest) -> Result<Verdict, VerificationError>;
}

/// Runs one model call per `verify`: encode, prompt, sanitize, parse, validate.
pub struct VerificationClient {
    provider: Arc<dyn VisionProvider>,
    output_language: String,
    request_timeout: Duration,
}

impl VerificationClient {
    pub fn new(provider: Arc<dyn VisionProvider>, config: &VerifierConfig) -> Self {
        Self {
            provider,
            output_language: config.output_language.clone(),
            request_timeout: config.request_timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Free-form caption of a photo; no verdict schema applies.
    pub fn describe(&self, image_path: &Path) -> Result<String, VerificationError> {
        let image = encode_image(image_path)?;
        let request = VisionRequest {
            system_instruction: describe_instruction(&self.output_language),
            user_instruction: "Describe this photo.".to_string(),
            image,
            response_schema: None,
            timeout: self.request_timeout.min(DESCRIBE_TIMEOUT),
        };
        let text = self
            .provider
            .complete(&request)
            .map_err(|err| classify_provider_error(&err))?;
        let caption = text.split_whitespace().collect::<Vec<&str>>().join(" ");
        if caption.is_empty() {
            return Err(VerificationError::extraction("empty caption"));
        }
        Ok(caption)
    }
}

impl Verifier for VerificationClient {
    fn verify(&self, request: &VerificationRequest) -> Result<Verdict, VerificationError> {
        let image = encode_image(&request.image_path)?;
        let vision_request = VisionRequest {
            system_instruction: verification_instruction(&self.output_language),
            user_instruction: challenge_instruction(
                &request.challenge_title,
                &request.challenge_description,
            ),
            image,
            response_schema: Some(response_schema_hint()),
            timeout: self.request_timeout,
        };
        let raw = self
            .provider
            .complete(&vision_request)
            .map_err(|err| classify_provider_error(&err))?;
        let candidate = extract_json(&raw)?;
        let parsed: Value = serde_json::from_str(&candidate)
            .map_err(|err| VerificationError::parse(format!("{err} in {candidate:?}")))?;
        validate(&parsed)
    }
}

pub fn verification_instruction(output_language: &str) -> String {
    format!(
        "You verify photos uploaded by wedding guests for photo challenges.\n\
         Judge the photo against the challenge using three criteria:\n\
         1. Relevance: does the photo show what the challenge asks for?\n\
         2. Execution: is the subject recognizable (framing, focus, lighting good enough)?\n\
         3. Authenticity: was the photo plausibly taken at the event, not a screenshot or stock image?\n\
         Answer with exactly one JSON object and nothing else, using these fields:\n\
         - \"isValid\": boolean, true only if the photo satisfies the challenge.\n\
         - \"confidence\": number between 0 and 1.\n\
         - \"explanation\": short explanation for the guest.\n\
         - \"suggestedImprovements\": optional tip, only when the photo fails or is borderline.\n\
         Write explanation and suggestedImprovements in {output_language}."
    )
}

pub fn challenge_instruction(title: &str, description: &str) -> String {
    format!(
        "Challenge: {}\nTask: {}\nDoes the attached photo complete this challenge?",
        title.trim(),
        description.trim()
    )
}

fn describe_instruction(output_language: &str) -> String {
    format!(
        "Describe the photo from a wedding celebration in one or two warm sentences. \
         Mention people, activity and mood. Reply in {output_language} with plain text only."
    )
}
