//! Pipeline error taxonomy.
//!
//! Every per-file failure maps to exactly one [`ErrorKind`]; the kind decides
//! local recovery (retry in exploration, skip, abort startup) and how the
//! failure is counted in the final summary. A per-file error never takes the
//! engine down.

use std::path::PathBuf;
use thiserror::Error;

/// Classification of a per-file (or startup) failure.
///
/// The variants mirror the recovery table the engine applies: exploration
/// retries, skips, warnings, and the two startup-fatal conditions
/// (`EncoderMissing`, store corruption at open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The probe could not make sense of the file at all.
    CorruptedInput,
    /// Predictor had no confident rule; handled internally by exploration.
    PredictorFallback,
    /// A required encoder binary is not installed.
    EncoderMissing,
    /// Encoder exited nonzero or produced no output.
    EncoderFailed,
    /// Encoder exceeded its wall-clock ceiling or stalled; process killed.
    EncoderTimeout,
    /// Output existed but failed a structural check.
    VerificationRejected,
    /// Output was not strictly smaller than the input.
    NoShrinkage,
    /// Embedded metadata / xattr / timestamp copy failed (non-fatal).
    MetadataMigrationFailed,
    /// The atomic replace protocol failed; undo stack was drained.
    SwapFailed,
    /// The learning store rejected a write.
    StoreWriteFailed,
    /// Global cancellation; not an error for summary purposes.
    Cancelled,
}

impl ErrorKind {
    /// Stable tag used in log lines and summary counters.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::CorruptedInput => "corrupted_input",
            ErrorKind::PredictorFallback => "predictor_fallback",
            ErrorKind::EncoderMissing => "encoder_missing",
            ErrorKind::EncoderFailed => "encoder_failed",
            ErrorKind::EncoderTimeout => "encoder_timeout",
            ErrorKind::VerificationRejected => "verification_rejected",
            ErrorKind::NoShrinkage => "no_shrinkage",
            ErrorKind::MetadataMigrationFailed => "metadata_migration_failed",
            ErrorKind::SwapFailed => "swap_failed",
            ErrorKind::StoreWriteFailed => "store_write_failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// True when a failed encode attempt may still be rescued by trying the
    /// exploration candidates.
    pub fn retryable_in_exploration(&self) -> bool {
        matches!(
            self,
            ErrorKind::EncoderFailed
                | ErrorKind::EncoderTimeout
                | ErrorKind::VerificationRejected
                | ErrorKind::NoShrinkage
        )
    }

    /// True when the condition must abort the whole run, not just one file.
    pub fn fatal_for_run(&self) -> bool {
        matches!(self, ErrorKind::EncoderMissing)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Error, Debug)]
pub enum PixlyError {
    #[error("Cannot probe file (corrupted or unreadable): {path}: {detail}")]
    CorruptedInput { path: PathBuf, detail: String },

    #[error("Required tool not found: {tool} ({hint})")]
    EncoderMissing { tool: String, hint: String },

    #[error("Encoder {tool} failed (exit {exit_code:?}): {stderr_tail}")]
    EncoderFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Encoder {tool} exceeded {limit_secs}s and was killed")]
    EncoderTimeout { tool: String, limit_secs: u64 },

    #[error("Output rejected by verifier: {reason}")]
    VerificationRejected { reason: String },

    #[error("Output offers no size benefit ({new_size} >= {original_size} bytes)")]
    NoShrinkage { original_size: u64, new_size: u64 },

    #[error("Metadata migration failed: {detail}")]
    MetadataMigrationFailed { detail: String },

    #[error("Atomic swap failed at step {step}: {detail}")]
    SwapFailed { step: &'static str, detail: String },

    #[error("Learning store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PixlyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PixlyError::CorruptedInput { .. } => ErrorKind::CorruptedInput,
            PixlyError::EncoderMissing { .. } => ErrorKind::EncoderMissing,
            PixlyError::EncoderFailed { .. } => ErrorKind::EncoderFailed,
            PixlyError::EncoderTimeout { .. } => ErrorKind::EncoderTimeout,
            PixlyError::VerificationRejected { .. } => ErrorKind::VerificationRejected,
            PixlyError::NoShrinkage { .. } => ErrorKind::NoShrinkage,
            PixlyError::MetadataMigrationFailed { .. } => ErrorKind::MetadataMigrationFailed,
            PixlyError::SwapFailed { .. } => ErrorKind::SwapFailed,
            PixlyError::StoreWriteFailed(_) => ErrorKind::StoreWriteFailed,
            PixlyError::Cancelled => ErrorKind::Cancelled,
            // Bare IO errors surface where a swap or probe step did not wrap
            // them; count them with the swap bucket so they stay visible.
            PixlyError::Io(_) => ErrorKind::SwapFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, PixlyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_tags_are_unique() {
        let kinds = [
            ErrorKind::CorruptedInput,
            ErrorKind::PredictorFallback,
            ErrorKind::EncoderMissing,
            ErrorKind::EncoderFailed,
            ErrorKind::EncoderTimeout,
            ErrorKind::VerificationRejected,
            ErrorKind::NoShrinkage,
            ErrorKind::MetadataMigrationFailed,
            ErrorKind::SwapFailed,
            ErrorKind::StoreWriteFailed,
            ErrorKind::Cancelled,
        ];
        let mut tags: Vec<&str> = kinds.iter().map(|k| k.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), kinds.len());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::EncoderFailed.retryable_in_exploration());
        assert!(ErrorKind::NoShrinkage.retryable_in_exploration());
        assert!(!ErrorKind::CorruptedInput.retryable_in_exploration());
        assert!(!ErrorKind::EncoderMissing.retryable_in_exploration());
    }

    #[test]
    fn test_only_encoder_missing_is_run_fatal() {
        assert!(ErrorKind::EncoderMissing.fatal_for_run());
        assert!(!ErrorKind::EncoderTimeout.fatal_for_run());
        assert!(!ErrorKind::SwapFailed.fatal_for_run());
    }

    #[test]
    fn test_error_kind_mapping() {
        let e = PixlyError::NoShrinkage {
            original_size: 100,
            new_size: 100,
        };
        assert_eq!(e.kind(), ErrorKind::NoShrinkage);

        let e = PixlyError::EncoderTimeout {
            tool: "cjxl".to_string(),
            limit_secs: 60,
        };
        assert_eq!(e.kind(), ErrorKind::EncoderTimeout);
    }
}
