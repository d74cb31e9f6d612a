// =============================================================================
// Engine Error Kinds
// =============================================================================
//
// Named error kinds so callers at component boundaries can match on them
// instead of string-sniffing an `anyhow::Error`. Everything above a component
// boundary still flows as `anyhow::Result` — `EngineError` is the leaf type
// that gets wrapped.
// =============================================================================

use thiserror::Error;

/// The error kinds named in the risk/error policy. Each variant corresponds
/// to one of the recovery paths: recovered locally, reconnect-with-backoff,
/// logged-as-success, or surfaced to the caller.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("config invalid: {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("remote rejected order: code={code} msg={msg}")]
    RemoteRejected { code: i64, msg: String },

    #[error("remote non-fatal: code={code} msg={msg}")]
    RemoteNonFatal { code: i64, msg: String },

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("predictor unavailable: {0}")]
    PredictorUnavailable(String),

    #[error("risk blocked: {0}")]
    RiskBlocked(String),

    #[error("feature invalid: {0}")]
    FeatureInvalid(String),
}

impl EngineError {
    /// Non-fatal exchange response codes that should be treated as
    /// success (value already equals requested; conflicting margin mode).
    pub fn is_non_fatal_code(code: i64) -> bool {
        matches!(code, 34002 | 10007)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
