//! Within-Block Ordering
//!
//! Produces one linear order per block. Pinned operations keep their program
//! order and floating operations are inserted around them:
//!
//! - a floating operation is emitted right before its first same-block
//!   consumer, after all of its own same-block inputs
//! - a mutable read sits on a watch list from the moment its last access has
//!   executed (or from block entry when the access lies elsewhere) and is
//!   flushed before the next kill of an overlapping location
//! - whatever is left is emitted before the terminator, which always ends
//!   the block
//!
//! An operation that needs a pinned operation the block only executes later
//! cannot be ordered without breaking program order; that is reported as
//! [`ScheduleError::FixedOrderViolated`].

use super::earliest::EarliestPlacement;
use super::{BlockAssignment, ScheduleContext};
use crate::error::ScheduleError;
use crate::ids::{BlockId, OpId};
use fxhash::FxHashMap;
use indexmap::IndexSet;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Pending,
    Visiting,
    Emitted,
}

struct BlockOrderer<'a, 'g> {
    ctx: ScheduleContext<'g>,
    placement: &'a BlockAssignment,
    block: BlockId,
    marks: &'a mut [Mark],
    order: Vec<OpId>,
}

impl<'a, 'g> BlockOrderer<'a, 'g> {
    fn is_local(&self, op: OpId) -> bool {
        self.placement.get(op) == Some(self.block)
    }

    /// Inputs that must precede `op` in its block
    fn local_inputs(&self, op: OpId) -> Vec<OpId> {
        let operation = self.ctx.graph.op(op);
        if operation.kind().is_merge() {
            return Vec::new();
        }
        operation
            .inputs()
            .iter()
            .copied()
            .chain(operation.last_access())
            .filter(|&input| self.is_local(input) && self.marks[input.index()] != Mark::Emitted)
            .collect()
    }

    /// Pinned operations emitted so far with `early` pulled in next, the
    /// order an input dependency on a later pinned operation would need
    fn fixed_order_violation(&self, early: OpId) -> ScheduleError {
        let graph = self.ctx.graph;
        let mut found: Vec<OpId> = self
            .order
            .iter()
            .copied()
            .filter(|&op| graph.op(op).is_pinned())
            .collect();
        found.push(early);
        ScheduleError::FixedOrderViolated {
            block: self.block,
            expected: self.ctx.cfg.block(self.block).fixed_ops().to_vec(),
            found,
        }
    }

    /// Emit `op` after every not-yet-emitted same-block input
    fn emit(&mut self, op: OpId) -> Result<(), ScheduleError> {
        if self.marks[op.index()] == Mark::Emitted {
            return Ok(());
        }
        let graph = self.ctx.graph;
        let mut stack: Vec<(OpId, bool)> = vec![(op, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                self.marks[current.index()] = Mark::Emitted;
                self.order.push(current);
                continue;
            }
            match self.marks[current.index()] {
                Mark::Emitted => continue,
                Mark::Visiting => {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "operations in {} form a cycle through {}",
                        self.block, current
                    )))
                }
                Mark::Pending => {}
            }
            self.marks[current.index()] = Mark::Visiting;
            stack.push((current, true));

            for input in self.local_inputs(current).into_iter().rev() {
                if graph.op(input).is_pinned() {
                    trace!(
                        "{}: {} depends on {}, which executes later in the block",
                        self.block,
                        current,
                        input
                    );
                    return Err(self.fixed_order_violation(input));
                }
                if self.marks[input.index()] == Mark::Visiting {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "operations in {} form a cycle through {} and {}",
                        self.block, current, input
                    )));
                }
                stack.push((input, false));
            }
        }
        Ok(())
    }
}

/// Order the operations of `block`
fn order_block(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    block: BlockId,
    floating: &[OpId],
    local_reads: Option<&Vec<OpId>>,
    marks: &mut [Mark],
) -> Result<Vec<OpId>, ScheduleError> {
    let graph = ctx.graph;
    let fixed = ctx.cfg.block(block).fixed_ops();

    // Reads whose last access executes in this block join the watch list
    // right after that access
    let mut reads_after: FxHashMap<OpId, Vec<OpId>> = FxHashMap::default();
    for &read in local_reads.into_iter().flatten() {
        if placement.get(read) != Some(block) {
            continue;
        }
        if let Some(access) = graph.op(read).last_access() {
            reads_after.entry(access).or_default().push(read);
        }
    }
    let deferred: usize = reads_after.values().map(Vec::len).sum();

    let mut watched: IndexSet<OpId> = floating
        .iter()
        .copied()
        .filter(|&op| graph.op(op).mutable_read_location().is_some())
        .filter(|op| !reads_after.values().any(|reads| reads.contains(op)))
        .collect();

    let mut orderer = BlockOrderer {
        ctx,
        placement,
        block,
        marks,
        order: Vec::with_capacity(fixed.len() + floating.len()),
    };

    for &op in fixed {
        let kind = graph.kind(op);
        if kind.is_kill() {
            let flushed: Vec<OpId> = watched
                .iter()
                .copied()
                .filter(|&read| {
                    graph
                        .kind(read)
                        .read_location()
                        .is_some_and(|location| kind.kills(location))
                })
                .collect();
            for read in flushed {
                watched.shift_remove(&read);
                trace!("{}: {} flushed before kill {}", block, read, op);
                orderer.emit(read)?;
            }
        }

        orderer.emit(op)?;

        if let Some(state) = graph.op(op).state_after() {
            if orderer.is_local(state) {
                orderer.emit(state)?;
            }
        }

        if let Some(reads) = reads_after.remove(&op) {
            watched.extend(reads);
        }
    }

    if !reads_after.is_empty() {
        let stranded: usize = reads_after.values().map(Vec::len).sum();
        return Err(ScheduleError::MalformedGraph(format!(
            "{} of {} reads in {} have a last access outside its fixed operations",
            stranded, deferred, block
        )));
    }

    for read in watched {
        orderer.emit(read)?;
    }
    for &op in floating {
        orderer.emit(op)?;
    }

    let mut order = orderer.order;
    if let Some(terminator) = ctx.cfg.terminator(graph, block) {
        if let Some(pos) = order.iter().position(|&op| op == terminator) {
            order.remove(pos);
            order.push(terminator);
        }
    }

    Ok(order)
}

/// Order every block; the result is indexed by block. Dead operations are
/// left out.
pub(crate) fn order_blocks(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    earliest: &EarliestPlacement,
) -> Result<Vec<Vec<OpId>>, ScheduleError> {
    let graph = ctx.graph;
    let local_reads = &earliest.local_reads;
    let mut floating: Vec<Vec<OpId>> = vec![Vec::new(); ctx.cfg.len()];
    for op in graph
        .iter()
        .filter(|op| !op.is_pinned() && earliest.is_live(op.id()))
    {
        let block = placement
            .get(op.id())
            .ok_or(ScheduleError::Unscheduled { op: op.id() })?;
        floating[block.index()].push(op.id());
    }

    let mut marks = vec![Mark::Pending; graph.capacity()];
    let mut result = Vec::with_capacity(ctx.cfg.len());
    for block in ctx.cfg.blocks() {
        let id = block.id();
        let order = order_block(
            ctx,
            placement,
            id,
            &floating[id.index()],
            local_reads.get(&id),
            &mut marks,
        )?;
        trace!(
            "{}: {}",
            id,
            order
                .iter()
                .map(|&op| format!("{}:{}", op, graph.kind(op).mnemonic()))
                .collect::<Vec<_>>()
                .join(" ")
        );
        result.push(order);
    }

    // Every operation emitted must be one of the block's own
    for (index, ops) in result.iter().enumerate() {
        let block = BlockId::from_index(index);
        if let Some(&stray) = ops.iter().find(|&&op| placement.get(op) != Some(block)) {
            return Err(ScheduleError::MalformedGraph(format!(
                "{} was ordered into {} but placed elsewhere",
                stray, block
            )));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScheduleInputBuilder;
    use crate::location::{LocationTag, MemoryEffect};
    use crate::schedule::{ScheduleConfig, SchedulingStrategy};

    const L: LocationTag = LocationTag::Mutable(1);
    const M: LocationTag = LocationTag::Mutable(2);

    fn position(order: &[OpId], op: OpId) -> usize {
        order.iter().position(|&o| o == op).unwrap()
    }

    #[test]
    fn test_read_flushed_before_overlapping_kill_only() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let other = b.block();
        b.edge(entry, other);
        let init = b.kill(entry, L, &[]);
        let read = b.read(L, Some(init), &[]);
        let unrelated = b.kill(entry, M, &[]);
        let overwrite = b.kill(entry, L, &[]);
        b.terminator(entry, &[]);
        b.terminator(other, &[read]);
        let mut input = b.finish().unwrap();

        let schedule = input
            .schedule(ScheduleConfig::development().with_strategy(SchedulingStrategy::Earliest))
            .unwrap();
        let order = schedule.ops_in(entry);
        assert!(position(order, init) < position(order, read));
        assert!(position(order, unrelated) < position(order, read));
        assert!(position(order, read) < position(order, overwrite));
    }

    #[test]
    fn test_floating_value_inserted_before_first_consumer() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let first = b.fixed(entry, MemoryEffect::None, &[]);
        let c = b.constant();
        let value = b.value(&[c]);
        let consumer = b.fixed(entry, MemoryEffect::None, &[value]);
        let term = b.terminator(entry, &[]);
        let mut input = b.finish().unwrap();

        let schedule = input.schedule(ScheduleConfig::development()).unwrap();
        assert_eq!(schedule.ops_in(entry), &[first, c, value, consumer, term]);
    }

    #[test]
    fn test_terminator_forced_last() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let exit = b.block();
        b.edge(entry, exit);
        let term = b.terminator(entry, &[]);
        let state = b.state(&[term]);
        b.attach_state(term, state);
        b.terminator(exit, &[]);
        let mut input = b.finish().unwrap();

        let schedule = input.schedule(ScheduleConfig::development()).unwrap();
        assert_eq!(schedule.ops_in(entry), &[state, term]);
    }

    #[test]
    fn test_pinned_input_later_in_block_rejected() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let c = b.constant();
        let early = b.fixed(entry, MemoryEffect::None, &[c]);
        let late = b.fixed(entry, MemoryEffect::None, &[]);
        // early consumes late, which the block runs afterwards
        b.set_input(early, 0, late);
        let term = b.terminator(entry, &[]);
        let mut input = b.finish().unwrap();

        match input.schedule(ScheduleConfig::development()) {
            Err(ScheduleError::FixedOrderViolated {
                block,
                expected,
                found,
            }) => {
                assert_eq!(block, entry);
                assert_eq!(expected, vec![early, late, term]);
                assert_eq!(found, vec![late]);
            }
            other => panic!("expected a fixed order violation, got {:?}", other),
        }
    }
}
