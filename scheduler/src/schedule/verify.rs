//! Schedule Verifier
//!
//! Independent recheck of a finished schedule. A forward dataflow over the
//! CFG tracks the set of pending reads: reads whose last access has executed
//! and whose location has not been killed since. Merges intersect the sets
//! of their predecessors. Every mutable read must be pending where it is
//! scheduled.

use super::{BlockAssignment, ScheduleContext};
use crate::error::ScheduleError;
use crate::ids::{BlockId, OpId};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;

type Pending = FxHashSet<OpId>;

struct Verifier<'g> {
    ctx: ScheduleContext<'g>,
    /// Reads released by each pinned access
    reads_by_access: FxHashMap<OpId, Vec<OpId>>,
    /// Reads that observe the unit's initial memory
    initial: Pending,
}

impl<'g> Verifier<'g> {
    fn new(ctx: ScheduleContext<'g>) -> Self {
        let mut reads_by_access: FxHashMap<OpId, Vec<OpId>> = FxHashMap::default();
        let mut initial = Pending::default();
        for op in ctx.graph.iter() {
            if op.mutable_read_location().is_none() {
                continue;
            }
            match op.last_access() {
                Some(access) => reads_by_access.entry(access).or_default().push(op.id()),
                None => {
                    initial.insert(op.id());
                }
            }
        }
        Self {
            ctx,
            reads_by_access,
            initial,
        }
    }

    /// Apply one operation to the pending set
    fn transfer(&self, op: OpId, pending: &mut Pending) {
        let graph = self.ctx.graph;
        let kind = graph.kind(op);
        if kind.is_kill() {
            pending.retain(|&read| {
                graph
                    .kind(read)
                    .read_location()
                    .map_or(true, |location| !kind.kills(location))
            });
        }
        if let Some(reads) = self.reads_by_access.get(&op) {
            pending.extend(reads.iter().copied());
        }
    }

    /// Pending set on entry to `block`; `None` while no predecessor is known
    fn meet(&self, block: BlockId, outs: &[Option<Pending>]) -> Option<Pending> {
        let cfg = self.ctx.cfg;
        let mut result: Option<Pending> = if block == cfg.entry() {
            Some(self.initial.clone())
        } else {
            None
        };
        for &pred in cfg.block(block).predecessors() {
            if let Some(out) = &outs[pred.index()] {
                result = Some(match result {
                    None => out.clone(),
                    Some(mut acc) => {
                        acc.retain(|read| out.contains(read));
                        acc
                    }
                });
            }
        }
        result
    }

    fn run(&self, block_ops: &[Vec<OpId>]) -> Result<(), ScheduleError> {
        let cfg = self.ctx.cfg;
        let mut outs: Vec<Option<Pending>> = vec![None; cfg.len()];

        let mut iterations = 0;
        let mut changed = true;
        while changed {
            changed = false;
            iterations += 1;
            for &block in cfg.reverse_postorder() {
                let Some(mut pending) = self.meet(block, &outs) else {
                    continue;
                };
                for &op in &block_ops[block.index()] {
                    self.transfer(op, &mut pending);
                }
                if outs[block.index()].as_ref() != Some(&pending) {
                    outs[block.index()] = Some(pending);
                    changed = true;
                }
            }
        }
        debug!("schedule verification converged after {} iterations", iterations);

        let graph = self.ctx.graph;
        for &block in cfg.reverse_postorder() {
            let mut pending = self.meet(block, &outs).unwrap_or_default();
            for &op in &block_ops[block.index()] {
                if graph.op(op).mutable_read_location().is_some() && !pending.contains(&op) {
                    return Err(ScheduleError::StaleRead { read: op, block });
                }
                self.transfer(op, &mut pending);
            }
        }
        Ok(())
    }
}

/// Check that every placed operation appears exactly once, in the block it
/// was assigned to
fn check_placements(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    block_ops: &[Vec<OpId>],
) -> Result<(), ScheduleError> {
    let mut seen: Vec<Option<BlockId>> = vec![None; ctx.graph.capacity()];
    for (index, ops) in block_ops.iter().enumerate() {
        let block = BlockId::from_index(index);
        for &op in ops {
            if let Some(existing) = seen[op.index()].replace(block) {
                return Err(ScheduleError::DuplicatePlacement {
                    op,
                    existing,
                    attempted: block,
                });
            }
            if let Some(assigned) = placement.get(op).filter(|&assigned| assigned != block) {
                return Err(ScheduleError::DuplicatePlacement {
                    op,
                    existing: assigned,
                    attempted: block,
                });
            }
        }
    }
    for op in ctx.graph.ids() {
        if placement.get(op).is_some() && seen[op.index()].is_none() {
            return Err(ScheduleError::Unscheduled { op });
        }
    }
    Ok(())
}

pub(crate) fn verify_schedule(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    block_ops: &[Vec<OpId>],
) -> Result<(), ScheduleError> {
    check_placements(ctx, placement, block_ops)?;
    Verifier::new(ctx).run(block_ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScheduleInputBuilder;
    use crate::location::LocationTag;
    use crate::schedule::{earliest::place_earliest, ordering::order_blocks, ScheduleConfig};

    const L: LocationTag = LocationTag::Mutable(1);

    #[test]
    fn test_read_after_kill_is_stale() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let init = b.kill(entry, L, &[]);
        let read = b.read(L, Some(init), &[]);
        let overwrite = b.kill(entry, L, &[]);
        let term = b.terminator(entry, &[read]);
        let input = b.finish().unwrap();

        let config = ScheduleConfig::development();
        let ctx = ScheduleContext {
            graph: &input.graph,
            cfg: &input.cfg,
            loops: &input.loops,
            config: &config,
        };
        let earliest = place_earliest(ctx).unwrap();
        let good = order_blocks(ctx, &earliest.blocks, &earliest).unwrap();
        assert_eq!(good[0], vec![init, read, overwrite, term]);
        verify_schedule(ctx, &earliest.blocks, &good).unwrap();

        let bad = vec![vec![init, overwrite, read, term]];
        assert_eq!(
            verify_schedule(ctx, &earliest.blocks, &bad),
            Err(ScheduleError::StaleRead { read, block: entry })
        );
    }

    #[test]
    fn test_kill_on_one_branch_is_stale_at_merge() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let left = b.block();
        let right = b.block();
        let merge = b.block();
        b.edge(entry, left);
        b.edge(entry, right);
        b.edge(left, merge);
        b.edge(right, merge);
        let init = b.kill(entry, L, &[]);
        let read = b.read(L, Some(init), &[]);
        let t0 = b.terminator(entry, &[]);
        let store = b.kill(left, L, &[]);
        let t1 = b.terminator(left, &[]);
        let t2 = b.terminator(right, &[]);
        let t3 = b.terminator(merge, &[read]);
        let input = b.finish().unwrap();

        let config = ScheduleConfig::development();
        let ctx = ScheduleContext {
            graph: &input.graph,
            cfg: &input.cfg,
            loops: &input.loops,
            config: &config,
        };
        let mut placement = BlockAssignment::with_pinned(&input.graph);
        placement.place(read, merge).unwrap();
        let ops = vec![vec![init, t0], vec![store, t1], vec![t2], vec![read, t3]];
        assert_eq!(
            verify_schedule(ctx, &placement, &ops),
            Err(ScheduleError::StaleRead { read, block: merge })
        );
    }

    #[test]
    fn test_missing_and_duplicate_operations() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let c = b.constant();
        let term = b.terminator(entry, &[c]);
        let input = b.finish().unwrap();

        let config = ScheduleConfig::development();
        let ctx = ScheduleContext {
            graph: &input.graph,
            cfg: &input.cfg,
            loops: &input.loops,
            config: &config,
        };
        let mut placement = BlockAssignment::with_pinned(&input.graph);
        placement.place(c, entry).unwrap();
        assert_eq!(
            verify_schedule(ctx, &placement, &[vec![term]]),
            Err(ScheduleError::Unscheduled { op: c })
        );
        assert!(matches!(
            verify_schedule(ctx, &placement, &[vec![c, c, term]]),
            Err(ScheduleError::DuplicatePlacement { .. })
        ));
    }
}
