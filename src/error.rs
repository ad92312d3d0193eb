//! Crate-wide error taxonomy.
//!
//! Per spec §7: denial is a normal `Decision`, never an error. `AscError`
//! only covers the boundary failures that a caller must branch on —
//! malformed RPC-shaped input and init-time pattern compilation failure.
//! Everywhere else (Redactor, Sanitizer, Policy Engine, Audit Trail) the
//! spec defines failure as data, not as `Result`, and that contract is
//! preserved: this type never appears in `Decision`-returning signatures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AscError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unknown quarantine entry: {0}")]
    UnknownQuarantineEntry(String),

    #[error("unknown action preview: {0}")]
    UnknownPreview(String),

    #[error("pattern table failed to compile: {0}")]
    PatternCompile(String),
}

pub type AscResult<T> = Result<T, AscError>;
