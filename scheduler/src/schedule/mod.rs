//! Global Instruction Scheduling
//!
//! Assigns every live operation of a [`Graph`] to one block of a
//! [`ControlFlowGraph`] and orders the operations of each block.
//!
//! ## Phases
//!
//! 1. **Earliest placement** ([`earliest`]): liveness from the pinned
//!    operations, dead-operation excision, and the deepest block each
//!    floating operation's inputs allow.
//! 2. **Latest placement** ([`latest`]): dominance join over usages, the
//!    memory-aware walk for floating reads, and optional hoisting out of
//!    loops. Skipped under [`SchedulingStrategy::Earliest`].
//! 3. **Within-block ordering** ([`ordering`]).
//! 4. **Verification** ([`verify`]), when enabled.
//!
//! Placements are collected in side tables and only written back to the
//! graph once every phase has succeeded, so a failed run leaves no partial
//! assignment behind.

pub mod earliest;
pub mod kill_set;
pub mod latest;
pub mod ordering;
pub mod verify;

pub use kill_set::KillSetAnalysis;

use crate::cfg::ControlFlowGraph;
use crate::error::ScheduleError;
use crate::graph::Graph;
use crate::ids::{BlockId, OpId};
use crate::loops::LoopForest;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Where floating operations end up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    /// As early as the inputs allow
    Earliest,

    /// As late as the usages and memory constraints allow
    Latest,

    /// Latest, then hoisted out of loops where legal
    LatestOutOfLoops,
}

/// Configuration for one scheduling run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub strategy: SchedulingStrategy,

    /// Re-check memory legality of the finished schedule
    pub verify_schedule: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::Latest,
            verify_schedule: cfg!(debug_assertions),
        }
    }
}

impl ScheduleConfig {
    /// Verification on, plain latest placement
    pub fn development() -> Self {
        Self {
            strategy: SchedulingStrategy::Latest,
            verify_schedule: true,
        }
    }

    /// Loop-invariant hoisting, no verification
    pub fn release() -> Self {
        Self {
            strategy: SchedulingStrategy::LatestOutOfLoops,
            verify_schedule: false,
        }
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_schedule = enabled;
        self
    }
}

/// Statistics collected during one scheduling run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleStats {
    /// Live operations placed (pinned and floating)
    pub operations_scheduled: usize,

    /// Operations excised as unreachable from any pinned operation
    pub dead_operations_removed: usize,

    /// Floating reads whose downward walk was stopped by a kill
    pub reads_stopped_by_kill: usize,

    /// Operations moved to a shallower loop depth
    pub operations_hoisted: usize,

    pub kill_set_cache_hits: usize,
    pub kill_set_cache_misses: usize,

    /// Total computation time in microseconds
    pub computation_time_us: u64,
}

/// Shared read-only inputs of the scheduling phases
#[derive(Clone, Copy)]
pub(crate) struct ScheduleContext<'g> {
    pub graph: &'g Graph,
    pub cfg: &'g ControlFlowGraph,
    pub loops: &'g LoopForest,
    pub config: &'g ScheduleConfig,
}

/// Side table of block placements indexed by operation
#[derive(Debug, Clone)]
pub(crate) struct BlockAssignment {
    blocks: Vec<Option<BlockId>>,
}

impl BlockAssignment {
    /// Table holding only the pinned operations' blocks
    pub fn with_pinned(graph: &Graph) -> Self {
        let mut blocks = vec![None; graph.capacity()];
        for op in graph.iter().filter(|op| op.is_pinned()) {
            blocks[op.id().index()] = op.block();
        }
        Self { blocks }
    }

    pub fn get(&self, op: OpId) -> Option<BlockId> {
        self.blocks[op.index()]
    }

    /// Record the single placement of `op`
    pub fn place(&mut self, op: OpId, block: BlockId) -> Result<(), ScheduleError> {
        match self.blocks[op.index()] {
            Some(existing) => Err(ScheduleError::DuplicatePlacement {
                op,
                existing,
                attempted: block,
            }),
            None => {
                self.blocks[op.index()] = Some(block);
                Ok(())
            }
        }
    }

    pub fn into_inner(self) -> Vec<Option<BlockId>> {
        self.blocks
    }
}

/// The finished schedule of one compilation unit
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    block_ops: Vec<Vec<OpId>>,
    op_blocks: Vec<Option<BlockId>>,
    stats: ScheduleStats,
}

impl Schedule {
    /// Operations of `block` in execution order
    pub fn ops_in(&self, block: BlockId) -> &[OpId] {
        &self.block_ops[block.index()]
    }

    /// Final block of `op`; `None` for excised operations
    pub fn block_of(&self, op: OpId) -> Option<BlockId> {
        self.op_blocks.get(op.index()).copied().flatten()
    }

    /// Every block with its ordered operations
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &[OpId])> + '_ {
        self.block_ops
            .iter()
            .enumerate()
            .map(|(i, ops)| (BlockId::from_index(i), ops.as_slice()))
    }

    /// Position of `op` within its block
    pub fn position_of(&self, op: OpId) -> Option<usize> {
        let block = self.block_of(op)?;
        self.ops_in(block).iter().position(|&o| o == op)
    }

    pub fn stats(&self) -> &ScheduleStats {
        &self.stats
    }
}

/// Two schedules are equal when they place and order identically
impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.block_ops == other.block_ops && self.op_blocks == other.op_blocks
    }
}

impl Eq for Schedule {}

/// The scheduling pass
pub struct SchedulePhase {
    config: ScheduleConfig,
}

impl SchedulePhase {
    pub fn new(config: ScheduleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Schedule `graph` over `cfg`.
    ///
    /// Requires dominators on `cfg` and a loop forest computed from it.
    /// Existing placements of floating operations are ignored, so running
    /// the pass twice yields the same schedule. The graph is only changed
    /// (dead operations excised, floating blocks assigned) once every phase
    /// has succeeded.
    pub fn run(
        &self,
        graph: &mut Graph,
        cfg: &ControlFlowGraph,
        loops: &LoopForest,
    ) -> Result<Schedule, ScheduleError> {
        let start = Instant::now();
        let mut stats = ScheduleStats::default();

        if cfg.reverse_postorder().len() != cfg.len() {
            return Err(ScheduleError::MalformedGraph(
                "dominators have not been computed".to_string(),
            ));
        }
        cfg.validate(graph)?;

        debug!(
            "scheduling {} operations over {} blocks with {:?}",
            graph.live_count(),
            cfg.len(),
            self.config.strategy
        );

        let ctx = ScheduleContext {
            graph: &*graph,
            cfg,
            loops,
            config: &self.config,
        };

        let earliest = earliest::place_earliest(ctx)?;
        stats.dead_operations_removed = earliest.dead.len();

        let placement = match self.config.strategy {
            SchedulingStrategy::Earliest => earliest.blocks.clone(),
            SchedulingStrategy::Latest | SchedulingStrategy::LatestOutOfLoops => {
                let mut kill_sets = KillSetAnalysis::new(ctx.graph, cfg);
                let placement = latest::place_latest(ctx, &earliest, &mut kill_sets, &mut stats)?;
                stats.kill_set_cache_hits = kill_sets.cache_hits();
                stats.kill_set_cache_misses = kill_sets.cache_misses();
                placement
            }
        };

        for op in ctx.graph.ids().filter(|&op| earliest.is_live(op)) {
            if placement.get(op).is_none() {
                return Err(ScheduleError::Unscheduled { op });
            }
        }

        let block_ops = ordering::order_blocks(ctx, &placement, &earliest)?;

        if self.config.verify_schedule {
            verify::verify_schedule(ctx, &placement, &block_ops)?;
        }

        // Every phase succeeded: publish
        if !earliest.dead.is_empty() {
            debug!("excising {} dead operations", earliest.dead.len());
            graph.excise(&earliest.dead);
        }
        let op_blocks = placement.into_inner();
        for (index, block) in op_blocks.iter().enumerate() {
            let op = OpId::from_index(index);
            if graph.get(op).is_some_and(|operation| !operation.is_pinned()) {
                graph.set_block(op, *block);
            }
        }

        stats.operations_scheduled = graph.live_count();
        stats.computation_time_us = start.elapsed().as_micros() as u64;
        info!(
            "scheduled {} operations ({} dead removed, {} reads stopped by kills, {} hoisted) in {}us",
            stats.operations_scheduled,
            stats.dead_operations_removed,
            stats.reads_stopped_by_kill,
            stats.operations_hoisted,
            stats.computation_time_us
        );

        Ok(Schedule {
            block_ops,
            op_blocks,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        assert_eq!(ScheduleConfig::development().strategy, SchedulingStrategy::Latest);
        assert!(ScheduleConfig::development().verify_schedule);
        assert!(!ScheduleConfig::release().verify_schedule);

        let config = ScheduleConfig::default()
            .with_strategy(SchedulingStrategy::Earliest)
            .with_verification(true);
        assert_eq!(config.strategy, SchedulingStrategy::Earliest);
        assert!(config.verify_schedule);
    }

    #[test]
    fn test_config_serde() {
        let config = ScheduleConfig::release();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"strategy":"LatestOutOfLoops","verify_schedule":false}"#);
        let back: ScheduleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_block_assignment_rejects_second_placement() {
        let mut graph = Graph::new();
        let op = graph.add(crate::graph::OperationKind::Value, &[]);
        let mut table = BlockAssignment::with_pinned(&graph);
        table.place(op, BlockId::from_raw(0)).unwrap();
        assert!(matches!(
            table.place(op, BlockId::from_raw(1)),
            Err(ScheduleError::DuplicatePlacement { .. })
        ));
        assert_eq!(table.get(op), Some(BlockId::from_raw(0)));
    }
}
