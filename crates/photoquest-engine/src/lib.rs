pub mod client;
pub mod config;
pub mod encoder;
pub mod policy;
pub mod provider;
pub mod retry;
pub mod upload;

use std::sync::Arc;

use anyhow::Result;
use photoquest_contracts::events::{EventPayload, EventSink};
use photoquest_contracts::limits::FixedWindowRateLimiter;
use photoquest_contracts::photos::PhotoStore;
use photoquest_contracts::progress::ProgressLedger;
use serde_json::Value;

pub use client::{VerificationClient, VerificationRequest, Verifier};
pub use config::VerifierConfig;
pub use policy::{ChallengeVerificationPolicy, GalleryAnalysisPolicy, GalleryAssessment};
pub use provider::{GeminiVisionProvider, VisionProvider};
pub use retry::{CancelFlag, RetryOutcome, RetryPolicy};
pub use upload::{ChallengeUpload, ChallengeUploadService, UploadError, UploadOutcome};

/// Wires one vision provider, the runtime config and an event sink into the call-site policies.
pub struct PhotoQuestEngine {
    config: VerifierConfig,
    client: Arc<VerificationClient>,
    events: Arc<dyn EventSink>,
}

impl PhotoQuestEngine {
    pub fn new(config: VerifierConfig, events: Arc<dyn EventSink>) -> Self {
        let provider = Arc::new(GeminiVisionProvider::new(&config));
        Self::with_provider(config, provider, events)
    }

    pub fn with_provider(
        config: VerifierConfig,
        provider: Arc<dyn VisionProvider>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let client = Arc::new(VerificationClient::new(provider, &config));
        Self {
            config,
            client,
            events,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.client.provider_name()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn challenge_policy(&self) -> ChallengeVerificationPolicy {
        ChallengeVerificationPolicy::new(
            self.client.clone(),
            RetryPolicy::from_config(&self.config),
            self.events.clone(),
        )
    }

    pub fn gallery_policy(&self) -> GalleryAnalysisPolicy {
        GalleryAnalysisPolicy::new(self.client.clone(), self.events.clone())
    }

    /// Upload service limited per participant by the configured fixed window.
    pub fn upload_service(
        &self,
        ledger: Arc<dyn ProgressLedger>,
        photos: Arc<dyn PhotoStore>,
    ) -> ChallengeUploadService {
        let limiter = Arc::new(FixedWindowRateLimiter::new(
            self.config.upload_limit,
            self.config.upload_window,
        ));
        ChallengeUploadService::new(
            self.challenge_policy(),
            ledger,
            photos,
            limiter,
            self.events.clone(),
        )
    }
}
