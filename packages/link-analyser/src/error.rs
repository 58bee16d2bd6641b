//! Error taxonomy (spec §7). These are *kinds*, not incidental failure types — callers branch
//! on the kind to decide retry/dead-letter/surface behaviour.

use thiserror::Error;

/// Failures the analyser pipeline can produce. Every variant maps to exactly one row in the
/// spec §7 taxonomy table.
#[derive(Debug, Error, Clone)]
pub enum AnalyserError {
    /// Timeout, connection reset, renderer crash. Retried via backoff, then proxy; on
    /// exhaustion surfaces as `problem / absent / non_indexable_reason=inconclusive`.
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// Primary document responded 403. Triggers immediate proxy fallback; if the proxy is
    /// also blocked, surfaces as `problem / absent / non_indexable_reason="blocked"`.
    #[error("blocked with 403")]
    Blocked403,

    /// Any other non-403 HTTP error status. No fallback; surfaces as `problem / absent` with
    /// the code preserved.
    #[error("http error: {0}")]
    HttpError(u16),

    /// Both direct fetch and the proxy failed to produce a usable page. Distinguished from a
    /// genuine "link absent" — never reported as a false negative.
    #[error("inconclusive: both direct fetch and proxy fallback failed")]
    Inconclusive,
}

impl AnalyserError {
    /// The `non_indexable_reason` (really: failure reason) string surfaced on the verdict.
    pub fn reason(&self) -> &'static str {
        match self {
            AnalyserError::TransientFetch(_) => "inconclusive",
            AnalyserError::Blocked403 => "blocked",
            AnalyserError::HttpError(_) => "absent",
            AnalyserError::Inconclusive => "inconclusive",
        }
    }

    /// HTTP status to record on the verdict, 0 when fabricated by a fallback path.
    pub fn response_code(&self) -> i32 {
        match self {
            AnalyserError::HttpError(code) => *code as i32,
            AnalyserError::Blocked403 => 403,
            _ => 0,
        }
    }
}

/// Rejected at enqueue time; never enters the queue.
#[derive(Debug, Error, Clone)]
pub enum MalformedInput {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("result range must have exactly {expected} columns, got {actual}")]
    InvalidResultRange { expected: usize, actual: usize },
}

/// Queue/repository/bus unreachable. The producer call fails; a scheduler run marks its sheet
/// `error` rather than retrying internally.
#[derive(Debug, Error, Clone)]
#[error("backend unavailable: {0}")]
pub struct BackendUnavailable(pub String);
