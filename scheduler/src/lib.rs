//! Memory-aware global instruction scheduler
//!
//! Takes an unordered graph of operations with data, state, and memory edges
//! together with a control flow graph, and assigns every live operation to one
//! block and one position within it.
//!
//! ```rust,ignore
//! use scheduler::{ScheduleConfig, ScheduleInputBuilder, LocationTag};
//!
//! let mut b = ScheduleInputBuilder::new();
//! let entry = b.entry();
//! let store = b.kill(entry, LocationTag::Mutable(0), &[]);
//! let load = b.read(LocationTag::Mutable(0), Some(store), &[]);
//! b.terminator(entry, &[load]);
//!
//! let mut input = b.finish()?;
//! let schedule = input.schedule(ScheduleConfig::development())?;
//! assert_eq!(schedule.ops_in(entry).len(), 3);
//! ```

pub mod builder;
pub mod cfg;
pub mod dump;
pub mod error;
pub mod graph;
pub mod ids;
pub mod location;
pub mod logging;
pub mod loops;
pub mod schedule;

pub use builder::{ScheduleInput, ScheduleInputBuilder};
pub use cfg::{Block, ControlFlowGraph};
pub use dump::{dump_schedule, schedule_to_json};
pub use error::{ErrorCode, ScheduleError};
pub use graph::{Graph, Operation, OperationKind};
pub use ids::{BlockId, LoopId, OpId};
pub use location::{KillSet, LocationTag, MemoryEffect};
pub use loops::{Loop, LoopForest};
pub use schedule::{Schedule, ScheduleConfig, SchedulePhase, ScheduleStats, SchedulingStrategy};

/// Schedule `graph` over `cfg` with the given configuration.
///
/// `cfg` must have its dominators computed and `loops` must describe it.
pub fn schedule_graph(
    graph: &mut Graph,
    cfg: &ControlFlowGraph,
    loops: &LoopForest,
    config: ScheduleConfig,
) -> Result<Schedule, ScheduleError> {
    SchedulePhase::new(config).run(graph, cfg, loops)
}
