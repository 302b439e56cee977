//! Error types for the dotclaw host.
//!
//! Provides [`DotclawError`] as the top-level error type and
//! [`ErrorCategory`], the classification that drives the failover state
//! machine: each category carries its own cooldown duration and
//! retryability. Classification happens at the layer that first observes
//! the failure; everything above only sees the category tag.

use thiserror::Error;

/// Top-level error type for the dotclaw host.
///
/// Variants are grouped into recoverable (agent run, provider, store
/// contention) and fatal (config, security, I/O) categories. Recoverable
/// variants carry an [`ErrorCategory`] so callers can consult the failover
/// policy without re-parsing messages.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DotclawError {
    // ── Recoverable ──────────────────────────────────────────────────

    /// An agent run failed with a classified category.
    #[error("agent run failed ({category}): {message}")]
    AgentRun {
        /// The failure classification.
        category: ErrorCategory,
        /// Sanitized error message (never contains secrets).
        message: String,
    },

    /// A provider (Telegram, Discord, ...) call failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// The run was preempted by a newer message for the same chat.
    #[error("run preempted by newer message")]
    Preempted,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    // ── Fatal ────────────────────────────────────────────────────────

    /// Configuration is structurally invalid (wrong JSON shape).
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A security boundary was violated (path traversal, unauthorized
    /// IPC request, disallowed mount).
    #[error("security violation: {reason}")]
    SecurityViolation {
        /// What policy was violated.
        reason: String,
    },

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DotclawError>;

/// Failure classification for the failover state machine.
///
/// The order here matters for [`ErrorCategory::classify`]: more specific
/// signals (auth, rate limit) are checked before the generic transient
/// bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid key, payment required, insufficient credit. Not retryable.
    Auth,
    /// The model provider is throttling requests.
    RateLimit,
    /// A client-side or upstream deadline was exceeded.
    Timeout,
    /// The prompt exceeded the model's context window.
    ContextOverflow,
    /// Connection resets, 5xx, DNS failures.
    Transient,
    /// Unparseable output or an empty success.
    InvalidResponse,
}

impl ErrorCategory {
    /// Classify a raw error message into a category.
    ///
    /// Pattern precedence: auth > rate limit > timeout > context overflow
    /// > transient > invalid response. Unknown messages fall into
    /// `Transient` so they stay retryable.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();

        const AUTH: &[&str] = &[
            "401",
            "403",
            "402",
            "invalid api key",
            "payment required",
            "insufficient credit",
            "unauthorized",
        ];
        const RATE: &[&str] = &["429", "rate limit", "too many requests"];
        const TIMEOUT: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];
        const OVERFLOW: &[&str] = &["context length", "too many tokens", "context window"];
        const TRANSIENT: &[&str] = &[
            "500",
            "502",
            "503",
            "504",
            "econnreset",
            "econnrefused",
            "eai_again",
            "enotfound",
            "connection reset",
            "connection refused",
        ];
        const INVALID: &[&str] = &["unparseable", "empty result", "invalid response"];

        for (patterns, category) in [
            (AUTH, Self::Auth),
            (RATE, Self::RateLimit),
            (TIMEOUT, Self::Timeout),
            (OVERFLOW, Self::ContextOverflow),
            (TRANSIENT, Self::Transient),
            (INVALID, Self::InvalidResponse),
        ] {
            if patterns.iter().any(|p| m.contains(p)) {
                return category;
            }
        }
        Self::Transient
    }

    /// Whether the failover policy may retry after this category.
    ///
    /// Auth failures fail fast: retrying with a different model cannot fix
    /// a revoked key or an empty balance.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Auth)
    }

    /// Cooldown applied to the failing model, in milliseconds.
    ///
    /// Timeouts get a stricter cooldown than generic transient failures: a
    /// model that hangs burns a semaphore permit for the full deadline,
    /// which is worse than one that fails fast.
    pub fn cooldown_ms(self) -> i64 {
        match self {
            Self::Auth => 6 * 60 * 60 * 1000,
            Self::RateLimit => 60_000,
            Self::Timeout => 120_000,
            Self::ContextOverflow => 10_000,
            Self::Transient => 30_000,
            Self::InvalidResponse => 10_000,
        }
    }

    /// Map the category to a user-visible chat message.
    pub fn humanize(self) -> &'static str {
        match self {
            Self::Auth => "I can't reach the model provider right now (authorization problem). Please check the API key.",
            Self::RateLimit => "I'm rate limited, trying again shortly.",
            Self::Timeout => "The model took too long to answer. I'll retry.",
            Self::ContextOverflow => "Your message was too long for that model.",
            Self::Transient => "I had trouble connecting. Trying again.",
            Self::InvalidResponse => "I got an empty answer from the model. Retrying once.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ContextOverflow => "context_overflow",
            Self::Transient => "transient",
            Self::InvalidResponse => "invalid_response",
        };
        f.write_str(s)
    }
}
