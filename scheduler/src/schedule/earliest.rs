//! Earliest Placement
//!
//! Walks the graph from every pinned operation, marking what is live, then
//! places each floating operation in the deepest block its inputs allow.
//! Phis are pinned, so every loop-carried edge ends at an operation that is
//! already placed; an input still open when its user is resolved can only
//! come from a cycle through floating operations, which has no legal
//! placement.

use super::{BlockAssignment, ScheduleContext};
use crate::error::ScheduleError;
use crate::ids::{BlockId, OpId};
use fxhash::FxHashMap;
use log::{debug, trace};

/// Output of earliest placement
#[derive(Debug, Clone)]
pub(crate) struct EarliestPlacement {
    /// Earliest block of every live operation
    pub blocks: BlockAssignment,

    /// Operations unreachable from any pinned operation
    pub dead: Vec<OpId>,

    /// Liveness mask indexed by operation
    live: Vec<bool>,

    /// Mutable reads placed in the same block as their last access
    pub local_reads: FxHashMap<BlockId, Vec<OpId>>,
}

impl EarliestPlacement {
    pub fn block_of(&self, op: OpId) -> Option<BlockId> {
        self.blocks.get(op)
    }

    /// Whether `op` is reachable from a pinned operation
    pub fn is_live(&self, op: OpId) -> bool {
        self.live.get(op.index()).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Expanding,
    Done,
}

struct Frame {
    op: OpId,
    expanded: bool,
}

/// Liveness walk from the pinned roots; returns the postorder of live
/// operations and the per-operation visit state
fn collect_live(ctx: ScheduleContext<'_>) -> (Vec<OpId>, Vec<VisitState>) {
    let graph = ctx.graph;
    let mut state = vec![VisitState::Unvisited; graph.capacity()];
    let mut order = Vec::with_capacity(graph.live_count());
    let mut stack: Vec<Frame> = Vec::new();

    for block in ctx.cfg.blocks() {
        for &root in block.fixed_ops() {
            if state[root.index()] != VisitState::Unvisited {
                continue;
            }
            stack.push(Frame {
                op: root,
                expanded: false,
            });

            while let Some(frame) = stack.pop() {
                let index = frame.op.index();
                if frame.expanded {
                    state[index] = VisitState::Done;
                    order.push(frame.op);
                    continue;
                }
                if state[index] != VisitState::Unvisited {
                    continue;
                }
                state[index] = VisitState::Expanding;
                stack.push(Frame {
                    op: frame.op,
                    expanded: true,
                });
                // Reversed so the first input is expanded first
                let inputs: Vec<OpId> = graph.op(frame.op).all_inputs().collect();
                for input in inputs.into_iter().rev() {
                    if state[input.index()] == VisitState::Unvisited {
                        stack.push(Frame {
                            op: input,
                            expanded: false,
                        });
                    }
                }
            }
        }
    }

    (order, state)
}

/// Deeper of two blocks on one dominator chain
fn deeper(
    ctx: ScheduleContext<'_>,
    op: OpId,
    current: BlockId,
    candidate: BlockId,
) -> Result<BlockId, ScheduleError> {
    if ctx.cfg.dominates(current, candidate) {
        Ok(candidate)
    } else if ctx.cfg.dominates(candidate, current) {
        Ok(current)
    } else {
        Err(ScheduleError::NoLegalBlock {
            op,
            reason: format!(
                "inputs are placed in {} and {}, neither of which dominates the other",
                current, candidate
            ),
        })
    }
}

/// Earliest block allowed by the placements of `op`'s inputs
fn resolve(
    ctx: ScheduleContext<'_>,
    blocks: &BlockAssignment,
    op: OpId,
) -> Result<BlockId, ScheduleError> {
    let operation = ctx.graph.op(op);
    let mut block = ctx.cfg.entry();
    // The state_after edge is skipped: a state capture may list the very
    // operation being resolved among its inputs.
    for input in operation.inputs().iter().copied().chain(operation.last_access()) {
        match blocks.get(input) {
            Some(input_block) => block = deeper(ctx, op, block, input_block)?,
            None => {
                return Err(ScheduleError::MalformedGraph(format!(
                    "floating operations form a cycle through {} and {}",
                    op, input
                )))
            }
        }
    }
    Ok(block)
}

pub(crate) fn place_earliest(ctx: ScheduleContext<'_>) -> Result<EarliestPlacement, ScheduleError> {
    let graph = ctx.graph;
    let (order, state) = collect_live(ctx);

    let live: Vec<bool> = state
        .iter()
        .map(|&visit| visit != VisitState::Unvisited)
        .collect();
    let dead: Vec<OpId> = graph.ids().filter(|op| !live[op.index()]).collect();

    let mut blocks = BlockAssignment::with_pinned(graph);
    for &op in &order {
        if graph.op(op).is_pinned() {
            continue;
        }
        let block = resolve(ctx, &blocks, op)?;
        trace!("earliest {} ({}) -> {}", op, graph.kind(op), block);
        blocks.place(op, block)?;
    }

    let mut local_reads: FxHashMap<BlockId, Vec<OpId>> = FxHashMap::default();
    for &op in &order {
        let operation = graph.op(op);
        if operation.mutable_read_location().is_none() {
            continue;
        }
        if let (Some(access), Some(block)) = (operation.last_access(), blocks.get(op)) {
            if blocks.get(access) == Some(block) {
                local_reads.entry(block).or_default().push(op);
            }
        }
    }

    debug!(
        "earliest placement: {} live, {} dead",
        order.len(),
        dead.len()
    );

    Ok(EarliestPlacement {
        blocks,
        dead,
        live,
        local_reads,
    })
}
