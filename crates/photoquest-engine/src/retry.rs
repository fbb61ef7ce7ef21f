use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use photoquest_contracts::events::{emit_best_effort, EventPayload, EventSink};
use photoquest_contracts::{VerificationError, VerificationErrorKind, Verdict};
use serde_json::Value;

use crate::client::{VerificationRequest, Verifier};
use crate::config::VerifierConfig;

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation signal for an in-flight upload.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Waits between attempts. Returns `false` when the wait was cut short by cancellation.
pub trait Pause: Send + Sync {
    fn pause(&self, delay: Duration, cancel: &CancelFlag) -> bool;
}

/// Sleeps on the current thread, checking the cancel flag every 50ms.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, delay: Duration, cancel: &CancelFlag) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub verdict: Verdict,
    pub attempts: usize,
    /// Error that forced the fallback verdict; `None` on success.
    pub last_error: Option<VerificationError>,
}

/// Bounded retries with linear backoff around a [`Verifier`], ending in a fail-closed verdict.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Duration,
    pause: Arc<dyn Pause>,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            pause: Arc::new(ThreadPause),
        }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        Self::new(config.max_retries, config.retry_backoff)
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Wait before the retry that follows failed attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.backoff
            .saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX))
    }

    /// Always yields a verdict; any failure that survives the retry budget becomes
    /// [`Verdict::fail_closed`].
    pub fn verify_with_retry(
        &self,
        verifier: &dyn Verifier,
        request: &VerificationRequest,
        cancel: &CancelFlag,
        events: &dyn EventSink,
    ) -> Verdict {
        self.run(verifier, request, cancel, events).verdict
    }

    pub fn run(
        &self,
        verifier: &dyn Verifier,
        request: &VerificationRequest,
        cancel: &CancelFlag,
        events: &dyn EventSink,
    ) -> RetryOutcome {
        let max_attempts = self.max_retries + 1;
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                last_error = Some(VerificationError::cancelled(
                    "verification cancelled before attempt",
                ));
                break;
            }
            attempts = attempt + 1;
            let err = match run_attempt(verifier, request) {
                Ok(verdict) => {
                    let mut payload = request_payload(request);
                    payload.insert("attempt".to_string(), Value::from(attempts));
                    payload.insert("is_valid".to_string(), Value::Bool(verdict.is_valid()));
                    payload.insert("confidence".to_string(), Value::from(verdict.confidence()));
                    emit_best_effort(events, "verification_succeeded", payload);
                    return RetryOutcome {
                        verdict,
                        attempts,
                        last_error: None,
                    };
                }
                Err(err) => err,
            };

            let delay = (err.is_retryable() && attempts < max_attempts)
                .then(|| self.delay_for(attempt));
            let mut payload = request_payload(request);
            payload.insert("attempt".to_string(), Value::from(attempts));
            payload.insert("max_attempts".to_string(), Value::from(max_attempts));
            payload.insert("error_kind".to_string(), Value::from(err.kind().as_str()));
            payload.insert("error".to_string(), Value::from(err.message()));
            payload.insert("retryable".to_string(), Value::Bool(err.is_retryable()));
            payload.insert(
                "next_delay_ms".to_string(),
                delay
                    .map(|delay| Value::from(delay.as_millis() as u64))
                    .unwrap_or(Value::Null),
            );
            emit_best_effort(events, "verification_attempt_failed", payload);
            last_error = Some(err);

            let Some(delay) = delay else {
                break;
            };
            if !self.pause.pause(delay, cancel) {
                last_error = Some(VerificationError::cancelled(
                    "verification cancelled during backoff",
                ));
                break;
            }
        }

        let mut payload = request_payload(request);
        payload.insert("attempts".to_string(), Value::from(attempts));
        payload.insert(
            "error_kind".to_string(),
            last_error
                .as_ref()
                .map(|err| Value::from(err.kind().as_str()))
                .unwrap_or(Value::Null),
        );
        emit_best_effort(events, "verification_fallback", payload);
        RetryOutcome {
            verdict: Verdict::fail_closed(),
            attempts,
            last_error,
        }
    }
}

/// One attempt with panics converted into [`VerificationErrorKind::Unexpected`].
fn run_attempt(
    verifier: &dyn Verifier,
    request: &VerificationRequest,
) -> Result<Verdict, VerificationError> {
    match panic::catch_unwind(AssertUnwindSafe(|| verifier.verify(request))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(VerificationError::new(
                VerificationErrorKind::Unexpected,
                format!("verifier panicked: {detail}"),
            ))
        }
    }
}

fn request_payload(request: &VerificationRequest) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert(
        "image_path".to_string(),
        Value::from(request.image_path.display().to_string()),
    );
    payload.insert(
        "challenge_title".to_string(),
        Value::from(request.challenge_title.clone()),
    );
    payload
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use photoquest_contracts::events::MemoryEventSink;
    use photoquest_contracts::{validate, VerificationError, VerificationErrorKind, Verdict};
    use serde_json::{json, Value};

    use super::{CancelFlag, Pause, RetryPolicy, ThreadPause};
    use crate::client::{VerificationRequest, Verifier};

    pub(crate) struct ScriptedVerifier {
        replies: Mutex<VecDeque<Result<Verdict, VerificationError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedVerifier {
        pub(crate) fn new(replies: Vec<Result<Verdict, VerificationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Verifier for ScriptedVerifier {
        fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .ok()
                .and_then(|mut replies| replies.pop_front())
                .unwrap_or_else(|| Err(VerificationError::parse("script exhausted")))
        }
    }

    /// Records requested delays without sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingPause {
        delays: Mutex<Vec<Duration>>,
        cancel_on_pause: bool,
    }

    impl RecordingPause {
        pub(crate) fn delays(&self) -> Vec<Duration> {
            self.delays.lock().map(|delays| delays.clone()).unwrap_or_default()
        }
    }

    impl Pause for RecordingPause {
        fn pause(&self, delay: Duration, cancel: &CancelFlag) -> bool {
            if let Ok(mut delays) = self.delays.lock() {
                delays.push(delay);
            }
            if self.cancel_on_pause {
                cancel.cancel();
            }
            !cancel.is_cancelled()
        }
    }

    pub(crate) fn approved_verdict() -> Verdict {
        validate(&json!({
            "isValid": true,
            "confidence": 0.9,
            "explanation": "The couple is cutting the cake.",
        }))
        .expect("fixture verdict is valid")
    }

    fn request() -> VerificationRequest {
        VerificationRequest::new("/uploads/cake.jpg", "Cake", "Photograph the cake cutting")
    }

    fn policy_with(pause: Arc<RecordingPause>) -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(2000)).with_pause(pause)
    }

    #[test]
    fn success_returns_immediately() {
        let verifier = ScriptedVerifier::new(vec![Ok(approved_verdict())]);
        let pause = Arc::new(RecordingPause::default());
        let events = MemoryEventSink::new("s");
        let outcome = policy_with(Arc::clone(&pause)).run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &events,
        );
        assert_eq!(outcome.verdict, approved_verdict());
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.last_error.is_none());
        assert!(pause.delays().is_empty());
        assert_eq!(events.events_of_type("verification_succeeded").len(), 1);
    }

    #[test]
    fn consecutive_parse_errors_fail_closed_after_three_attempts() {
        let verifier = ScriptedVerifier::new(vec![
            Err(VerificationError::parse("garbage 1")),
            Err(VerificationError::parse("garbage 2")),
            Err(VerificationError::parse("garbage 3")),
        ]);
        let pause = Arc::new(RecordingPause::default());
        let events = MemoryEventSink::new("s");
        let verdict = policy_with(Arc::clone(&pause)).verify_with_retry(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &events,
        );

        assert!(!verdict.is_valid());
        assert_eq!(verdict.confidence(), 0.0);
        assert!(verdict.explanation().contains("technical reasons"));
        assert!(verdict
            .suggested_improvements()
            .unwrap_or_default()
            .contains("try again"));
        assert_eq!(verifier.calls(), 3);
        assert_eq!(
            pause.delays(),
            vec![Duration::from_millis(2000), Duration::from_millis(4000)]
        );

        let failures = events.events_of_type("verification_attempt_failed");
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0]["attempt"], json!(1));
        assert_eq!(failures[0]["error_kind"], json!("parse"));
        assert_eq!(failures[0]["next_delay_ms"], json!(2000));
        assert_eq!(failures[2]["next_delay_ms"], Value::Null);
        assert_eq!(events.events_of_type("verification_fallback").len(), 1);
    }

    #[test]
    fn io_error_is_not_retried() {
        let verifier = ScriptedVerifier::new(vec![
            Err(VerificationError::io("permission denied")),
            Ok(approved_verdict()),
        ]);
        let pause = Arc::new(RecordingPause::default());
        let outcome = policy_with(Arc::clone(&pause)).run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(verifier.calls(), 1);
        assert!(pause.delays().is_empty());
        assert_eq!(
            outcome.last_error.map(|err| err.kind()),
            Some(VerificationErrorKind::Io)
        );
    }

    #[test]
    fn transient_failures_recover_on_retry() {
        let verifier = ScriptedVerifier::new(vec![
            Err(VerificationError::timeout("deadline")),
            Err(VerificationError::upstream_status(503, "overloaded")),
            Ok(approved_verdict()),
        ]);
        let pause = Arc::new(RecordingPause::default());
        let outcome = policy_with(Arc::clone(&pause)).run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_valid());
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn rejected_upstream_is_terminal() {
        let verifier = ScriptedVerifier::new(vec![Err(VerificationError::upstream_status(
            401, "bad key",
        ))]);
        let outcome = policy_with(Arc::new(RecordingPause::default())).run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(verifier.calls(), 1);
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let verifier = ScriptedVerifier::new(vec![Err(VerificationError::validation("bad"))]);
        let policy = RetryPolicy::new(0, Duration::from_millis(2000))
            .with_pause(Arc::new(RecordingPause::default()));
        let outcome = policy.run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(verifier.calls(), 1);
    }

    #[test]
    fn cancellation_during_backoff_stops_retries() {
        let verifier = ScriptedVerifier::new(vec![
            Err(VerificationError::extraction("no braces")),
            Ok(approved_verdict()),
        ]);
        let pause = Arc::new(RecordingPause {
            cancel_on_pause: true,
            ..RecordingPause::default()
        });
        let outcome = policy_with(Arc::clone(&pause)).run(
            &verifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(verifier.calls(), 1);
        assert_eq!(
            outcome.last_error.map(|err| err.kind()),
            Some(VerificationErrorKind::Cancelled)
        );
    }

    #[test]
    fn cancelled_before_start_makes_no_attempt() {
        let verifier = ScriptedVerifier::new(vec![Ok(approved_verdict())]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = policy_with(Arc::new(RecordingPause::default())).run(
            &verifier,
            &request(),
            &cancel,
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(outcome.attempts, 0);
        assert_eq!(verifier.calls(), 0);
    }

    struct PanickingVerifier;

    impl Verifier for PanickingVerifier {
        fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerificationError> {
            panic!("model client exploded");
        }
    }

    #[test]
    fn panics_become_fail_closed_verdicts() {
        let pause = Arc::new(RecordingPause::default());
        let outcome = policy_with(Arc::clone(&pause)).run(
            &PanickingVerifier,
            &request(),
            &CancelFlag::new(),
            &MemoryEventSink::new("s"),
        );
        assert!(outcome.verdict.is_fallback());
        assert_eq!(outcome.attempts, 1);
        let err = outcome.last_error.expect("panic recorded");
        assert_eq!(err.kind(), VerificationErrorKind::Unexpected);
        assert!(err.message().contains("model client exploded"));
    }

    #[test]
    fn thread_pause_honors_cancellation() {
        let cancel = CancelFlag::new();
        assert!(ThreadPause.pause(Duration::from_millis(5), &cancel));
        cancel.cancel();
        assert!(!ThreadPause.pause(Duration::from_secs(60), &cancel));
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::new(2, Duration::from_millis(2000));
        assert_eq!(policy.delay_for(0), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(6000));
    }
}
