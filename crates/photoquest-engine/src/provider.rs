use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use photoquest_contracts::{VerificationError, VerificationErrorKind};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::config::VerifierConfig;
use crate::encoder::EncodedImage;

/// One multimodal model call: instructions plus a single inline image.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub system_instruction: String,
    pub user_instruction: String,
    pub image: EncodedImage,
    /// Advisory output schema; providers without constrained output ignore it.
    pub response_schema: Option<Value>,
    pub timeout: Duration,
}

/// A vision-capable model endpoint returning free text.
pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &VisionRequest) -> Result<String>;
}

pub struct GeminiVisionProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl GeminiVisionProvider {
    pub fn new(config: &VerifierConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http: HttpClient::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &VisionRequest) -> Value {
        let mut generation_config = json!({
            "temperature": 0.2,
        });
        if let Some(schema) = &request.response_schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema.clone();
        }
        json!({
            "systemInstruction": {
                "parts": [{ "text": request.system_instruction }],
            },
            "contents": [{
                "role": "user",
                "parts": [
                    request.image.inline_part(),
                    { "text": request.user_instruction },
                ],
            }],
            "generationConfig": generation_config,
        })
    }

    /// Concatenates every text part of every candidate.
    fn extract_text(payload: &Value) -> String {
        let mut parts = Vec::new();
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for candidate in candidates {
            let chunks = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for chunk in chunks {
                if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
            }
        }
        parts.join("\n")
    }
}

impl VisionProvider for GeminiVisionProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, request: &VisionRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(VerificationError::new(
                VerificationErrorKind::UpstreamRejected,
                "GEMINI_API_KEY (or GOOGLE_API_KEY) not set",
            )
            .into());
        };
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(request.timeout)
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Gemini request failed ({})", self.api_base))?;
        let payload = response_json_or_error(response)?;
        let text = Self::extract_text(&payload);
        if text.is_empty() {
            return Err(VerificationError::extraction("Gemini response contained no text").into());
        }
        Ok(text)
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("Gemini response body read failed")?;
    if !status.is_success() {
        return Err(VerificationError::upstream_status(code, &truncate_text(&body, 512)).into());
    }
    let parsed: Value = serde_json::from_str(&body).map_err(|err| {
        VerificationError::new(
            VerificationErrorKind::UpstreamUnavailable,
            format!("Gemini returned an invalid JSON envelope: {err}"),
        )
    })?;
    Ok(parsed)
}

/// Maps a provider failure onto the verification error taxonomy by walking its cause chain.
pub fn classify_provider_error(err: &anyhow::Error) -> VerificationError {
    let message = error_chain_text(err, 600);
    for cause in err.chain() {
        if let Some(typed) = cause.downcast_ref::<VerificationError>() {
            return typed.clone();
        }
        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            if http_err.is_timeout() {
                return VerificationError::timeout(message);
            }
            if http_err.is_connect() || http_err.is_request() || http_err.is_body() {
                return VerificationError::new(VerificationErrorKind::UpstreamUnavailable, message);
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return VerificationError::timeout(message);
            }
        }
    }
    VerificationError::unexpected(message)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
