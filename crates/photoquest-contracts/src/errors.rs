use std::fmt;

/// Failure classes of a single verification attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VerificationErrorKind {
    Io,
    Timeout,
    Extraction,
    Parse,
    Validation,
    UpstreamUnavailable,
    UpstreamRejected,
    Cancelled,
    Unexpected,
}

impl VerificationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Extraction => "extraction",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamRejected => "upstream_rejected",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }

    /// Whether another attempt can plausibly produce a different outcome.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Extraction
                | Self::Parse
                | Self::Validation
                | Self::UpstreamUnavailable
        )
    }
}

impl fmt::Display for VerificationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationError {
    kind: VerificationErrorKind,
    message: String,
}

impl VerificationError {
    pub fn new(kind: VerificationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Timeout, message)
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Extraction, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Parse, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Validation, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Cancelled, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Unexpected, message)
    }

    /// Maps an upstream HTTP status onto the retryable/terminal split.
    pub fn upstream_status(code: u16, body: &str) -> Self {
        let kind = if code == 429 || (500..600).contains(&code) {
            VerificationErrorKind::UpstreamUnavailable
        } else {
            VerificationErrorKind::UpstreamRejected
        };
        let body = body.trim();
        if body.is_empty() {
            Self::new(kind, format!("vision request failed ({code})"))
        } else {
            Self::new(kind, format!("vision request failed ({code}): {body}"))
        }
    }

    pub fn kind(&self) -> VerificationErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for VerificationError {}
