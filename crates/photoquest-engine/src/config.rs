use std::env;
use std::time::Duration;

use photoquest_contracts::limits::{DEFAULT_UPLOAD_LIMIT, DEFAULT_UPLOAD_WINDOW};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VISION_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_OUTPUT_LANGUAGE: &str = "English";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(2000);

/// Runtime settings of the verification pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub output_language: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub upload_limit: u32,
    pub upload_window: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_VISION_MODEL.to_string(),
            output_language: DEFAULT_OUTPUT_LANGUAGE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            upload_limit: DEFAULT_UPLOAD_LIMIT,
            upload_window: DEFAULT_UPLOAD_WINDOW,
        }
    }
}

impl VerifierConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values count as unset and numeric
    /// values are clamped to safe ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str, default: f64, min: f64, max: f64| {
            get(key)
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .map(|value| value.clamp(min, max))
                .unwrap_or(default)
        };

        Self {
            api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            model: get("PHOTOQUEST_VISION_MODEL")
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            output_language: get("PHOTOQUEST_OUTPUT_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_OUTPUT_LANGUAGE.to_string()),
            request_timeout: Duration::from_secs_f64(number(
                "PHOTOQUEST_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT.as_secs_f64(),
                5.0,
                120.0,
            )),
            max_retries: number(
                "PHOTOQUEST_MAX_RETRIES",
                DEFAULT_MAX_RETRIES as f64,
                0.0,
                5.0,
            )
            .round() as usize,
            retry_backoff: Duration::from_millis(number(
                "PHOTOQUEST_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF.as_millis() as f64,
                0.0,
                30_000.0,
            ) as u64),
            upload_limit: number(
                "PHOTOQUEST_UPLOAD_LIMIT",
                f64::from(DEFAULT_UPLOAD_LIMIT),
                1.0,
                1000.0,
            )
            .round() as u32,
            upload_window: Duration::from_secs(number(
                "PHOTOQUEST_UPLOAD_WINDOW_SECS",
                DEFAULT_UPLOAD_WINDOW.as_secs() as f64,
                1.0,
                86_400.0,
            ) as u64),
        }
    }
}
