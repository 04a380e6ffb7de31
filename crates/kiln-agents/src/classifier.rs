//! Failure classification.
//!
//! [`classify`] maps raw error text to an [`ErrorCategory`] and the
//! [`RetryStrategy`] the execution loop should apply next. Matching is
//! lowercase substring search plus standalone HTTP status tokens, in fixed
//! priority order, so the same text always yields the same classification.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use kiln_core::types::RetryStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NonRetriable,
    RateLimit,
    Transient,
    Context,
    Structural,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::NonRetriable => "non_retriable",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Context => "context",
            ErrorCategory::Structural => "structural",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub strategy: RetryStrategy,
}

impl Classification {
    fn new(category: ErrorCategory, strategy: RetryStrategy) -> Self {
        Self { category, strategy }
    }

    pub fn is_non_retriable(&self) -> bool {
        self.category == ErrorCategory::NonRetriable
    }
}

/// Recovery action chosen after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDecision {
    RetrySame,
    SwitchProvider,
    SpawnSolver,
    Abort,
}

impl RecoveryDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryDecision::RetrySame => "retry_same",
            RecoveryDecision::SwitchProvider => "switch_provider",
            RecoveryDecision::SpawnSolver => "spawn_solver",
            RecoveryDecision::Abort => "abort",
        }
    }

    pub const ALL: [RecoveryDecision; 4] = [
        RecoveryDecision::RetrySame,
        RecoveryDecision::SwitchProvider,
        RecoveryDecision::SpawnSolver,
        RecoveryDecision::Abort,
    ];
}

impl fmt::Display for RecoveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

const GUARDRAIL_PATTERNS: &[&str] = &["build not active", "build request budget exceeded"];

const CREDIT_PATTERNS: &[&str] = &[
    "insufficient_credits",
    "insufficient credits",
    "billing",
    "quota",
    "payment required",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "authentication",
];

const UNCONFIGURED_PATTERNS: &[&str] = &[
    "no ai providers available",
    "client not available for provider",
    "failed to select provider",
    "provider not configured",
];

/// Wrong-endpoint errors that a different model or provider can satisfy.
const CHAT_ENDPOINT_PATTERNS: &[&str] = &["not a chat model", "v1/chat/completions endpoint"];

const MODEL_QUALIFIERS: &[&str] = &["not found", "not_found_error", "unsupported", "invalid", "unknown"];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests"];

const TRANSIENT_PATTERNS: &[&str] = &[
    "service unavailable",
    "bad gateway",
    "internal server error",
    "timeout",
    "timed out",
    "connection",
];

const CONTEXT_PATTERNS: &[&str] = &["context length", "too long", "max tokens"];

const STRUCTURAL_PATTERNS: &[&str] = &["verification failed", "build failed", "syntax error", "compilation"];

const TRUNCATION_PATTERNS: &[&str] = &[
    "unterminated code block",
    "likely truncated source file",
    "abrupt eof",
];

// HTTP status codes only count as standalone tokens, never inside token
// counts, delays or request ids.
static CREDIT_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b402\b").expect("Invalid credit status regex"));

static AUTH_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(401|403)\b").expect("Invalid auth status regex"));

static RATE_LIMIT_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b429\b").expect("Invalid rate limit status regex"));

static TRANSIENT_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(500|502|503|504)\b").expect("Invalid server status regex"));

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn is_credit_text(lower: &str) -> bool {
    contains_any(lower, CREDIT_PATTERNS) || CREDIT_STATUS.is_match(lower)
}

fn is_non_retriable_text(lower: &str) -> bool {
    if contains_any(lower, GUARDRAIL_PATTERNS)
        || is_credit_text(lower)
        || contains_any(lower, AUTH_PATTERNS)
        || AUTH_STATUS.is_match(lower)
    {
        return true;
    }
    if contains_any(lower, CHAT_ENDPOINT_PATTERNS) {
        return false;
    }
    if contains_any(lower, UNCONFIGURED_PATTERNS) {
        return true;
    }
    if lower.contains("model") && contains_any(lower, MODEL_QUALIFIERS) {
        return true;
    }
    lower.contains("unsupported for generatecontent")
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn classify(error_text: &str) -> Classification {
    let lower = error_text.to_lowercase();

    if is_non_retriable_text(&lower) {
        return Classification::new(ErrorCategory::NonRetriable, RetryStrategy::NonRetriable);
    }
    if contains_any(&lower, RATE_LIMIT_PATTERNS) || RATE_LIMIT_STATUS.is_match(&lower) {
        return Classification::new(ErrorCategory::RateLimit, RetryStrategy::Backoff);
    }
    if contains_any(&lower, TRANSIENT_PATTERNS) || TRANSIENT_STATUS.is_match(&lower) {
        return Classification::new(ErrorCategory::Transient, RetryStrategy::SwitchProvider);
    }
    if contains_any(&lower, CONTEXT_PATTERNS) {
        return Classification::new(ErrorCategory::Context, RetryStrategy::ReduceContext);
    }
    if contains_any(&lower, STRUCTURAL_PATTERNS) {
        return Classification::new(ErrorCategory::Structural, RetryStrategy::FixAndRetry);
    }
    Classification::new(ErrorCategory::Unknown, RetryStrategy::StandardRetry)
}

pub fn is_insufficient_credits(error_text: &str) -> bool {
    is_credit_text(&error_text.to_lowercase())
}

pub fn is_truncation(error_text: &str) -> bool {
    contains_any(&error_text.to_lowercase(), TRUNCATION_PATTERNS)
}

pub fn strategy_to_decision(strategy: RetryStrategy) -> RecoveryDecision {
    match strategy {
        RetryStrategy::SwitchProvider => RecoveryDecision::SwitchProvider,
        RetryStrategy::NonRetriable => RecoveryDecision::Abort,
        RetryStrategy::FixAndRetry
        | RetryStrategy::StandardRetry
        | RetryStrategy::Backoff
        | RetryStrategy::ReduceContext => RecoveryDecision::RetrySame,
    }
}
