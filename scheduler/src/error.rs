//! Scheduling Errors
//!
//! Every failure of the scheduler is an internal compiler error: the input
//! graph was malformed by an upstream pass, or the scheduler itself is wrong.
//! Nothing here is recoverable and nothing is retried; the driver aborts the
//! current compilation unit and reports the error.
//!
//! # Error Codes
//!
//! Codes live in the E9000-E9999 internal compiler error range:
//!
//! - E9100-E9149: malformed scheduler input
//! - E9150-E9199: placement failures
//! - E9200-E9249: within-block ordering failures
//! - E9250-E9299: schedule verification failures

use crate::ids::{BlockId, OpId};
use std::fmt;

/// Error code struct containing the numeric code and human-readable description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// The numeric error code (e.g., 9150)
    pub code: u16,
    /// Human-readable error category
    pub category: &'static str,
    /// Brief description of what this error means
    pub description: &'static str,
}

impl ErrorCode {
    pub const fn new(code: u16, category: &'static str, description: &'static str) -> Self {
        Self {
            code,
            category,
            description,
        }
    }

    /// Format the error code as "E{code:04}" (e.g., "E9150")
    pub fn format_code(&self) -> String {
        format!("E{:04}", self.code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {}",
            self.format_code(),
            self.category,
            self.description
        )
    }
}

pub const MALFORMED_GRAPH: ErrorCode =
    ErrorCode::new(9100, "input", "Malformed operation graph or CFG");
pub const UNSCHEDULED_OPERATION: ErrorCode =
    ErrorCode::new(9101, "input", "Live operation left without a block");
pub const DUPLICATE_PLACEMENT: ErrorCode =
    ErrorCode::new(9150, "placement", "Operation placed into a block twice");
pub const NO_LEGAL_BLOCK: ErrorCode =
    ErrorCode::new(9151, "placement", "No legal block exists for an operation");
pub const FIXED_ORDER_VIOLATED: ErrorCode = ErrorCode::new(
    9200,
    "ordering",
    "Fixed operations were reordered within their block",
);
pub const STALE_READ: ErrorCode = ErrorCode::new(
    9250,
    "verification",
    "Floating read may observe memory killed after its last access",
);

/// Fatal scheduling failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// An operation received a second placement
    DuplicatePlacement {
        op: OpId,
        existing: BlockId,
        attempted: BlockId,
    },

    /// The dominance constraints on an operation cannot be satisfied
    NoLegalBlock { op: OpId, reason: String },

    /// Within-block ordering permuted the pinned operations of a block
    FixedOrderViolated {
        block: BlockId,
        expected: Vec<OpId>,
        found: Vec<OpId>,
    },

    /// The verifier saw a read whose location may have been killed
    StaleRead { read: OpId, block: BlockId },

    /// A live operation ended the pass without a block
    Unscheduled { op: OpId },

    /// The input graph or CFG violates a structural precondition
    MalformedGraph(String),
}

impl ScheduleError {
    /// Registry entry for this error
    pub fn code(&self) -> &'static ErrorCode {
        match self {
            Self::DuplicatePlacement { .. } => &DUPLICATE_PLACEMENT,
            Self::NoLegalBlock { .. } => &NO_LEGAL_BLOCK,
            Self::FixedOrderViolated { .. } => &FIXED_ORDER_VIOLATED,
            Self::StaleRead { .. } => &STALE_READ,
            Self::Unscheduled { .. } => &UNSCHEDULED_OPERATION,
            Self::MalformedGraph(_) => &MALFORMED_GRAPH,
        }
    }
}

fn join_ids(ids: &[OpId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal compiler error {}: ", self.code().format_code())?;
        match self {
            Self::DuplicatePlacement {
                op,
                existing,
                attempted,
            } => write!(
                f,
                "{} already placed in {}, cannot place it in {}",
                op, existing, attempted
            ),
            Self::NoLegalBlock { op, reason } => {
                write!(f, "no legal block for {}: {}", op, reason)
            }
            Self::FixedOrderViolated {
                block,
                expected,
                found,
            } => write!(
                f,
                "fixed operations of {} reordered: expected [{}], found [{}]",
                block,
                join_ids(expected),
                join_ids(found)
            ),
            Self::StaleRead { read, block } => write!(
                f,
                "{} in {} may observe a value killed after its last access",
                read, block
            ),
            Self::Unscheduled { op } => write!(f, "{} was not assigned a block", op),
            Self::MalformedGraph(msg) => write!(f, "malformed graph: {}", msg),
        }
    }
}

impl std::error::Error for ScheduleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_internal_range() {
        for code in [
            &MALFORMED_GRAPH,
            &UNSCHEDULED_OPERATION,
            &DUPLICATE_PLACEMENT,
            &NO_LEGAL_BLOCK,
            &FIXED_ORDER_VIOLATED,
            &STALE_READ,
        ] {
            assert!((9000..10000).contains(&code.code), "{}", code);
        }
    }

    #[test]
    fn test_display() {
        let err = ScheduleError::StaleRead {
            read: OpId::from_raw(4),
            block: BlockId::from_raw(2),
        };
        assert_eq!(
            err.to_string(),
            "internal compiler error E9250: v4 in bb2 may observe a value killed after its last access"
        );
        assert_eq!(STALE_READ.to_string(), format!("E9250 [verification]: {}", STALE_READ.description));
    }
}
