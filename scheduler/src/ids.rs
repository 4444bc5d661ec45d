//! Core ID Types for the Scheduler
//!
//! Operations, blocks and loops are stored in arenas and referenced by
//! lightweight `u32` wrappers. Each kind gets its own type so a block index
//! can never be handed to an API expecting an operation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define ID types with consistent behavior
macro_rules! define_id_type {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Create a new ID from a raw u32 value
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            /// Position of this ID in its owning arena
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

define_id_type!(
    /// Identifier of an operation in a [`Graph`](crate::graph::Graph)
    OpId, "v"
);

define_id_type!(
    /// Identifier of a basic block in a [`ControlFlowGraph`](crate::cfg::ControlFlowGraph)
    BlockId, "bb"
);

define_id_type!(
    /// Identifier of a natural loop in a [`LoopForest`](crate::loops::LoopForest)
    LoopId, "loop"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(OpId::from_raw(7).to_string(), "v7");
        assert_eq!(BlockId::from_raw(0).to_string(), "bb0");
        assert_eq!(LoopId::from_raw(2).to_string(), "loop2");
    }

    #[test]
    fn test_id_ordering() {
        assert!(OpId::from_raw(1) < OpId::from_raw(2));
        assert_eq!(BlockId::from_index(3).index(), 3);
    }
}
