//! Request, result and descriptor types shared by every component
//!
//! `ExecutionRequest` and `ExecutionResult` are plain values owned by the call that
//! created them. The constructors on `ExecutionResult` are the only way the crate
//! builds results, which keeps the outcome/exit-code pairing consistent no matter
//! which provider produced the data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

pub const MIN_TIMEOUT_SECONDS: u64 = 1;
pub const MAX_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Clamps a caller-supplied timeout into the accepted range.
pub fn clamp_timeout_seconds(requested: i64) -> u64 {
    requested.clamp(MIN_TIMEOUT_SECONDS as i64, MAX_TIMEOUT_SECONDS as i64) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
    timeout_seconds: u64,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            language: language.into(),
            source: source.into(),
            stdin: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the wall-clock budget. Out-of-range values are clamped, never rejected.
    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = clamp_timeout_seconds(timeout_seconds);
        self
    }

    pub fn timeout_seconds(&self) -> u64 {
        // Deserialized requests bypass the builder.
        self.timeout_seconds
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    ProviderUnavailable,
    AllProvidersExhausted,
    InternalError,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::ProviderUnavailable => "provider_unavailable",
            Outcome::AllProvidersExhausted => "all_providers_exhausted",
            Outcome::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub language: String,
    pub provider_used: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    fn base(request: &ExecutionRequest, language: &str, outcome: Outcome) -> Self {
        Self {
            request_id: request.request_id.clone(),
            language: language.to_string(),
            provider_used: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: 0,
            outcome,
            error: None,
        }
    }

    pub fn completed(
        request: &ExecutionRequest,
        language: &str,
        provider: &str,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        exit_code: i64,
        duration_ms: u64,
    ) -> Self {
        let mut result = Self::base(request, language, Outcome::Completed)
            .with_output(stdout, stderr)
            .with_provider(provider);
        result.exit_code = Some(exit_code);
        result.duration_ms = duration_ms;
        result
    }

    pub fn timed_out(
        request: &ExecutionRequest,
        language: &str,
        provider: &str,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        duration_ms: u64,
    ) -> Self {
        let mut result = Self::base(request, language, Outcome::TimedOut)
            .with_output(stdout, stderr)
            .with_provider(provider);
        result.duration_ms = duration_ms;
        result
    }

    pub fn provider_unavailable(
        request: &ExecutionRequest,
        language: &str,
        provider: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::base(request, language, Outcome::ProviderUnavailable)
            .with_provider(provider)
            .with_error(message)
    }

    pub fn all_providers_exhausted(
        request: &ExecutionRequest,
        language: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::base(request, language, Outcome::AllProvidersExhausted).with_error(message)
    }

    pub fn internal_error(
        request: &ExecutionRequest,
        language: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::base(request, language, Outcome::InternalError).with_error(message)
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider_used = Some(provider.to_string());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    fn with_output(mut self, stdout: CapturedOutput, stderr: CapturedOutput) -> Self {
        self.stdout = stdout.text;
        self.stdout_truncated = stdout.truncated;
        self.stderr = stderr.text;
        self.stderr_truncated = stderr.truncated;
        self
    }

    /// Enforces that an exit code is present exactly when the outcome is `Completed`.
    pub fn normalized(mut self) -> Self {
        if self.outcome != Outcome::Completed {
            self.exit_code = None;
        } else if self.exit_code.is_none() {
            self.outcome = Outcome::InternalError;
            self.error
                .get_or_insert_with(|| "completed result without exit code".to_string());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_code == Some(0)
    }
}

/// Text decoded from an `OutputCapture`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Caps an already-complete string, e.g. one returned by a remote sandbox.
    pub fn from_text(text: &str, cap: usize) -> Self {
        let mut capture = OutputCapture::new(cap);
        capture.push(text.as_bytes());
        capture.finish()
    }
}

/// Byte accumulator that keeps at most `cap` bytes of a stream.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..take]);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(mut self) -> CapturedOutput {
        // Drop a multi-byte character split by the cap instead of replacing it.
        if self.truncated {
            if let Err(e) = std::str::from_utf8(&self.buf) {
                if e.error_len().is_none() {
                    self.buf.truncate(e.valid_up_to());
                }
            }
        }
        // Replacement characters are wider than the bytes they stand for, so the
        // cap is applied again to the decoded text.
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if text.len() > self.cap {
            let mut end = self.cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            self.truncated = true;
        }
        CapturedOutput {
            text,
            truncated: self.truncated,
        }
    }
}

/// The closed set of backend kinds the service knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Cloud,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub supported_languages: BTreeSet<String>,
    /// Lower is preferred.
    pub priority: i32,
}

impl ProviderDescriptor {
    pub fn new<I, S>(name: impl Into<String>, kind: ProviderKind, priority: i32, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind,
            supported_languages: languages.into_iter().map(Into::into).collect(),
            priority,
        }
    }

    pub fn supports(&self, canonical_language: &str) -> bool {
        self.supported_languages.contains(canonical_language)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub available: bool,
    pub latency_ms: u64,
}

impl HealthProbeResult {
    pub fn unavailable(latency_ms: u64) -> Self {
        Self {
            available: false,
            latency_ms,
        }
    }
}
