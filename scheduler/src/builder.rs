//! Schedule Input Builder
//!
//! Builds a consistent operation graph, CFG, and loop forest in one go.
//! Drivers with their own CFG construction feed [`SchedulePhase`] directly;
//! this builder serves everything else (tests, benches, small tools).
//!
//! Construction errors are recorded and reported once by
//! [`ScheduleInputBuilder::finish`], so building code can stay linear.

use crate::cfg::ControlFlowGraph;
use crate::error::ScheduleError;
use crate::graph::{Graph, OperationKind};
use crate::ids::{BlockId, OpId};
use crate::location::{LocationTag, MemoryEffect};
use crate::loops::LoopForest;
use crate::schedule::{Schedule, ScheduleConfig, SchedulePhase};
use log::debug;
use smallvec::SmallVec;

/// A graph ready for scheduling
#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub graph: Graph,
    pub cfg: ControlFlowGraph,
    pub loops: LoopForest,
}

impl ScheduleInput {
    /// Run the scheduler over this input
    pub fn schedule(&mut self, config: ScheduleConfig) -> Result<Schedule, ScheduleError> {
        SchedulePhase::new(config).run(&mut self.graph, &self.cfg, &self.loops)
    }
}

/// Builder for [`ScheduleInput`]
pub struct ScheduleInputBuilder {
    graph: Graph,
    cfg: ControlFlowGraph,
    error: Option<ScheduleError>,
}

impl Default for ScheduleInputBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleInputBuilder {
    /// Create a builder holding just the entry block
    pub fn new() -> Self {
        let mut cfg = ControlFlowGraph::new();
        cfg.add_block();
        Self {
            graph: Graph::new(),
            cfg,
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), ScheduleError>) {
        if let Err(err) = result {
            self.error.get_or_insert(err);
        }
    }

    fn pinned(&mut self, block: BlockId, kind: OperationKind, inputs: &[OpId]) -> OpId {
        let op = self.graph.add(kind, inputs);
        let result = self.cfg.append_fixed(&mut self.graph, block, op);
        self.record(result);
        op
    }

    // === Blocks ===

    pub fn entry(&self) -> BlockId {
        self.cfg.entry()
    }

    pub fn block(&mut self) -> BlockId {
        self.cfg.add_block()
    }

    /// Add a block with a label shown in dumps
    pub fn labeled_block(&mut self, label: &str) -> BlockId {
        let id = self.cfg.add_block();
        self.set_label(id, label);
        id
    }

    pub fn set_label(&mut self, block: BlockId, label: &str) {
        self.cfg.set_label(block, label);
    }

    /// Control-flow edge; the order of calls fixes phi input positions
    pub fn edge(&mut self, from: BlockId, to: BlockId) {
        self.cfg.add_edge(from, to);
    }

    // === Floating operations ===

    /// Floating value with no inputs
    pub fn constant(&mut self) -> OpId {
        self.graph.add(OperationKind::Value, &[])
    }

    pub fn value(&mut self, inputs: &[OpId]) -> OpId {
        self.graph.add(OperationKind::Value, inputs)
    }

    /// Floating read of `location` whose last known access is `last_access`
    pub fn read(&mut self, location: LocationTag, last_access: Option<OpId>, inputs: &[OpId]) -> OpId {
        let op = self.graph.add(OperationKind::FloatingRead(location), inputs);
        if let Some(access) = last_access {
            let result = self.graph.set_last_access(op, access);
            self.record(result);
        }
        op
    }

    /// Deoptimization state capture
    pub fn state(&mut self, inputs: &[OpId]) -> OpId {
        self.graph.add(OperationKind::StateCapture, inputs)
    }

    // === Pinned operations ===

    /// Fixed operation appended to `block`
    pub fn fixed(&mut self, block: BlockId, effect: MemoryEffect, inputs: &[OpId]) -> OpId {
        self.pinned(block, OperationKind::Fixed(effect), inputs)
    }

    /// Fixed operation overwriting `location`
    pub fn kill(&mut self, block: BlockId, location: LocationTag, inputs: &[OpId]) -> OpId {
        self.fixed(block, MemoryEffect::KillsSingle(location), inputs)
    }

    pub fn kill_multi(&mut self, block: BlockId, locations: &[LocationTag], inputs: &[OpId]) -> OpId {
        let effect = MemoryEffect::KillsMulti(SmallVec::from_slice(locations));
        self.fixed(block, effect, inputs)
    }

    /// Fixed operation overwriting all memory
    pub fn kill_all(&mut self, block: BlockId, inputs: &[OpId]) -> OpId {
        self.fixed(block, MemoryEffect::KillsAll, inputs)
    }

    /// Value merge; input `i` arrives along predecessor edge `i`
    pub fn phi(&mut self, block: BlockId, inputs: &[OpId]) -> OpId {
        self.pinned(block, OperationKind::Phi, inputs)
    }

    pub fn memory_phi(&mut self, block: BlockId, location: LocationTag, inputs: &[OpId]) -> OpId {
        self.pinned(block, OperationKind::MemoryPhi(location), inputs)
    }

    pub fn proxy(&mut self, block: BlockId, input: OpId) -> OpId {
        self.pinned(block, OperationKind::LoopExitProxy, &[input])
    }

    pub fn terminator(&mut self, block: BlockId, inputs: &[OpId]) -> OpId {
        self.pinned(block, OperationKind::Terminator, inputs)
    }

    // === Edge edits ===

    /// Replace input `index` of `user`, e.g. to close a loop-carried phi edge
    pub fn set_input(&mut self, user: OpId, index: usize, input: OpId) {
        if index >= self.graph.op(user).inputs().len() {
            self.record(Err(ScheduleError::MalformedGraph(format!(
                "{} has no input {}",
                user, index
            ))));
            return;
        }
        self.graph.replace_input(user, index, input);
    }

    /// Attach `state` as the state after `op`
    pub fn attach_state(&mut self, op: OpId, state: OpId) {
        let result = self.graph.set_state_after(op, state);
        self.record(result);
    }

    /// Compute dominators and loops, then validate the result
    pub fn finish(self) -> Result<ScheduleInput, ScheduleError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let Self { graph, mut cfg, .. } = self;

        cfg.compute_dominators()?;
        let mut loops = LoopForest::analyze(&mut cfg);
        loops.summarize_kills(&graph, &cfg);
        cfg.validate(&graph)?;

        debug!(
            "built schedule input: {} operations, {} blocks, {} loops",
            graph.live_count(),
            cfg.len(),
            loops.len()
        );
        Ok(ScheduleInput { graph, cfg, loops })
    }
}
