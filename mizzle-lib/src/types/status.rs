use std::fmt;

use serde::Serialize;

/// Terminal status of a single input URL after the engine is done with it.
///
/// A batch run never aborts because of one URL; each input ends up in
/// exactly one of these states and the run reports the full tally.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FinalStatus {
    /// The URL was fetched (or extracted) successfully
    Succeeded {
        /// HTTP status of the successful attempt, if any
        status: Option<u16>,
        /// Number of attempts it took
        attempts: u32,
    },
    /// All attempts failed or a fatal error occurred
    Failed {
        /// Description of the last error
        error: String,
        /// Number of attempts made
        attempts: u32,
    },
    /// The URL was never attempted (invalid input or duplicate)
    Skipped {
        /// Why the URL was skipped
        reason: String,
    },
    /// A shutdown signal arrived before the URL completed
    Cancelled,
}

impl FinalStatus {
    /// Whether this URL ended in success
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Whether this URL counts as a failure (skips and cancellations
    /// do not)
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { status, attempts } => match status {
                Some(code) => write!(f, "ok [{code}] ({attempts} attempt(s))"),
                None => write!(f, "ok ({attempts} attempt(s))"),
            },
            Self::Failed { error, attempts } => {
                write!(f, "failed after {attempts} attempt(s): {error}")
            }
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
