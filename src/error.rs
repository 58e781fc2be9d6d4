use std::fmt::{Debug, Display};

/// Errors produced by host-side validation before any device work is queued.
///
/// Every operator validates eagerly on the host, so a returned error
/// guarantees that nothing was enqueued and no output was written.
#[derive(Clone, PartialEq, Eq)]
pub enum JaggedError {
    /// Two operands disagree on a size that must match.
    ShapeMismatch {
        /// Which argument carried the offending size.
        argument: &'static str,
        /// The size implied by the other operands.
        expected: usize,
        /// The size actually found.
        actual: usize,
    },

    /// The number of offset sequences is zero or exceeds
    /// [`MAX_JAGGED_DEPTH`](crate::MAX_JAGGED_DEPTH).
    UnsupportedDepth {
        /// Number of offset sequences provided.
        depth: usize,
    },

    /// An offsets array or a per-key partition is malformed.
    InvalidOffsets {
        /// What was wrong with it.
        reason: String,
    },
}

impl Display for JaggedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for JaggedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JaggedError::ShapeMismatch {
                argument,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Shape mismatch for {argument}: expected {expected}, got {actual}"
                )
            }
            JaggedError::UnsupportedDepth { depth } => {
                write!(
                    f,
                    "Jagged tensors support 1 to {} offset sequences, got {depth}",
                    crate::MAX_JAGGED_DEPTH
                )
            }
            JaggedError::InvalidOffsets { reason } => {
                write!(f, "Invalid offsets: {reason}")
            }
        }
    }
}

impl std::error::Error for JaggedError {}
