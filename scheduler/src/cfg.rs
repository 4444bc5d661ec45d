//! Control Flow Graph
//!
//! Blocks, their edges, and the pinned operations each block executes in
//! program order. The dominator tree is stored directly on the blocks
//! (`dominator`, `dominator_depth`) once [`ControlFlowGraph::compute_dominators`]
//! has run.

use crate::error::ScheduleError;
use crate::graph::{Graph, OperationKind};
use crate::ids::{BlockId, LoopId, OpId};
use fxhash::FxHashSet;
use smallvec::SmallVec;

/// A basic block
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,

    /// Human-readable label (for dumps)
    pub label: Option<String>,

    predecessors: SmallVec<[BlockId; 2]>,
    successors: SmallVec<[BlockId; 2]>,

    /// Immediate dominator (entry block has none)
    dominator: Option<BlockId>,

    /// Dominator tree depth (entry = 0)
    dominator_depth: u32,

    /// Innermost containing loop
    loop_id: Option<LoopId>,

    /// Pinned operations in program order
    fixed: Vec<OpId>,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            label: None,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            dominator: None,
            dominator_depth: 0,
            loop_id: None,
            fixed: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.successors
    }

    pub fn dominator(&self) -> Option<BlockId> {
        self.dominator
    }

    pub fn dominator_depth(&self) -> u32 {
        self.dominator_depth
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        self.loop_id
    }

    /// Pinned operations in program order, terminator last
    pub fn fixed_ops(&self) -> &[OpId] {
        &self.fixed
    }

    pub fn is_merge(&self) -> bool {
        self.predecessors.len() > 1
    }
}

/// Control flow graph of one compilation unit
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    blocks: Vec<Block>,
    reverse_postorder: Vec<BlockId>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block; the first block added is the entry block
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(Block::new(id));
        id
    }

    /// Add a control-flow edge. Edge order defines predecessor positions,
    /// which phi inputs follow.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].successors.push(to);
        self.blocks[to.index()].predecessors.push(from);
    }

    /// Bind a pinned operation to the end of `block`'s program order
    pub fn append_fixed(
        &mut self,
        graph: &mut Graph,
        block: BlockId,
        op: OpId,
    ) -> Result<(), ScheduleError> {
        if !graph.kind(op).is_pinned() {
            return Err(ScheduleError::MalformedGraph(format!(
                "{} ({}) floats and cannot be bound to {}",
                op,
                graph.kind(op),
                block
            )));
        }
        if let Some(existing) = graph.block_of(op) {
            return Err(ScheduleError::DuplicatePlacement {
                op,
                existing,
                attempted: block,
            });
        }
        graph.set_block(op, Some(block));
        self.blocks[block.index()].fixed.push(op);
        Ok(())
    }

    pub fn set_label(&mut self, block: BlockId, label: &str) {
        self.blocks[block.index()].label = Some(label.to_string());
    }

    pub(crate) fn set_loop(&mut self, block: BlockId, loop_id: Option<LoopId>) {
        self.blocks[block.index()].loop_id = loop_id;
    }

    pub fn entry(&self) -> BlockId {
        BlockId::from_raw(0)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in reverse postorder, available after dominator computation
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.reverse_postorder
    }

    /// Terminator of a block, if it has one
    pub fn terminator(&self, graph: &Graph, block: BlockId) -> Option<OpId> {
        self.block(block)
            .fixed
            .last()
            .copied()
            .filter(|&op| matches!(graph.kind(op), OperationKind::Terminator))
    }

    pub fn is_successor(&self, from: BlockId, to: BlockId) -> bool {
        self.block(from).successors.contains(&to)
    }

    /// Compute the dominator tree using Cooper, Harvey, and Kennedy's
    /// iterative algorithm over reverse postorder.
    pub fn compute_dominators(&mut self) -> Result<(), ScheduleError> {
        if self.blocks.is_empty() {
            return Err(ScheduleError::MalformedGraph("CFG has no blocks".to_string()));
        }
        let entry = self.entry();
        let rpo = self.compute_reverse_postorder(entry);
        if rpo.len() != self.blocks.len() {
            let reached: FxHashSet<BlockId> = rpo.iter().copied().collect();
            let unreachable: Vec<String> = self
                .blocks
                .iter()
                .map(|b| b.id)
                .filter(|b| !reached.contains(b))
                .map(|b| b.to_string())
                .collect();
            return Err(ScheduleError::MalformedGraph(format!(
                "unreachable blocks: {}",
                unreachable.join(", ")
            )));
        }

        let mut rpo_index = vec![usize::MAX; self.blocks.len()];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_index[b.index()] = i;
        }

        // Entry dominates itself, others undefined
        let mut idom: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        idom[entry.index()] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &self.blocks[block.index()].predecessors {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }
                if new_idom != idom[block.index()] {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        // Depths follow RPO: a block's idom always precedes it
        for &block in &rpo {
            let (dominator, depth) = if block == entry {
                (None, 0)
            } else {
                let dom = idom[block.index()].ok_or_else(|| {
                    ScheduleError::MalformedGraph(format!("{} has no dominator", block))
                })?;
                (Some(dom), self.blocks[dom.index()].dominator_depth + 1)
            };
            let b = &mut self.blocks[block.index()];
            b.dominator = dominator;
            b.dominator_depth = depth;
        }

        self.reverse_postorder = rpo;
        Ok(())
    }

    fn compute_reverse_postorder(&self, entry: BlockId) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited[entry.index()] = true;

        while let Some(&mut (block, ref mut next)) = stack.last_mut() {
            let successors = &self.blocks[block.index()].successors;
            if *next < successors.len() {
                let succ = successors[*next];
                *next += 1;
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }

        postorder.reverse();
        postorder
    }

    fn intersect(
        mut b1: BlockId,
        mut b2: BlockId,
        idom: &[Option<BlockId>],
        rpo_index: &[usize],
    ) -> BlockId {
        while b1 != b2 {
            while rpo_index[b1.index()] > rpo_index[b2.index()] {
                match idom[b1.index()] {
                    Some(dom) => b1 = dom,
                    None => return b1,
                }
            }
            while rpo_index[b2.index()] > rpo_index[b1.index()] {
                match idom[b2.index()] {
                    Some(dom) => b2 = dom,
                    None => return b2,
                }
            }
        }
        b1
    }

    /// Check if block `a` dominates block `b` (reflexive)
    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        let depth_a = self.block(a).dominator_depth;
        while self.block(b).dominator_depth > depth_a {
            match self.block(b).dominator {
                Some(dom) => b = dom,
                None => return false,
            }
        }
        a == b
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Deepest block dominating both `a` and `b`
    pub fn common_dominator(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            let depth_a = self.block(a).dominator_depth;
            let depth_b = self.block(b).dominator_depth;
            if depth_a >= depth_b {
                match self.block(a).dominator {
                    Some(dom) => a = dom,
                    None => return a,
                }
            } else {
                match self.block(b).dominator {
                    Some(dom) => b = dom,
                    None => return b,
                }
            }
        }
        a
    }

    /// Dominator-tree path from `top` down to `bottom`, both included.
    /// Returns `None` when `top` does not dominate `bottom`.
    pub fn dominator_path(&self, top: BlockId, bottom: BlockId) -> Option<Vec<BlockId>> {
        let mut path = vec![bottom];
        let mut current = bottom;
        while current != top {
            current = self.block(current).dominator?;
            path.push(current);
        }
        path.reverse();
        Some(path)
    }

    /// Check the structural preconditions the scheduler relies on
    pub fn validate(&self, graph: &Graph) -> Result<(), ScheduleError> {
        for block in &self.blocks {
            for (pos, &op) in block.fixed.iter().enumerate() {
                let operation = graph.get(op).ok_or_else(|| {
                    ScheduleError::MalformedGraph(format!("{} lists deleted {}", block.id, op))
                })?;
                if operation.block() != Some(block.id) {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "{} is listed in {} but bound to {:?}",
                        op,
                        block.id,
                        operation.block()
                    )));
                }
                match operation.kind() {
                    OperationKind::Terminator if pos + 1 != block.fixed.len() => {
                        return Err(ScheduleError::MalformedGraph(format!(
                            "terminator {} is not last in {}",
                            op, block.id
                        )));
                    }
                    OperationKind::Phi | OperationKind::MemoryPhi(_)
                        if operation.inputs().len() != block.predecessors.len() =>
                    {
                        return Err(ScheduleError::MalformedGraph(format!(
                            "{} has {} inputs but {} has {} predecessors",
                            op,
                            operation.inputs().len(),
                            block.id,
                            block.predecessors.len()
                        )));
                    }
                    OperationKind::MemoryPhi(tag) if !tag.is_mutable() => {
                        return Err(ScheduleError::MalformedGraph(format!(
                            "{} merges immutable location {}",
                            op, tag
                        )));
                    }
                    OperationKind::Fixed(effect)
                        if effect.locations().iter().any(|tag| !tag.is_mutable()) =>
                    {
                        return Err(ScheduleError::MalformedGraph(format!(
                            "{} kills an immutable location",
                            op
                        )));
                    }
                    _ => {}
                }
            }
        }

        for op in graph.iter() {
            if op.is_pinned() && op.block().is_none() {
                return Err(ScheduleError::MalformedGraph(format!(
                    "pinned {} ({}) is not bound to a block",
                    op.id(),
                    op.kind()
                )));
            }
            if let Some(access) = op.last_access() {
                if !graph.get(access).map_or(false, |a| a.is_pinned()) {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "last access {} of {} is not a live pinned operation",
                        access,
                        op.id()
                    )));
                }
            }
        }
        Ok(())
    }
}
