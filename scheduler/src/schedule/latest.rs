//! Latest Placement
//!
//! Sinks every floating operation towards its usages. The latest legal block
//! is the dominance join of the usages' effective blocks:
//!
//! - a phi-like usage counts at the predecessor feeding the used edge
//! - a state capture counts at the blocks of its own consumers
//! - anything else counts at its own block
//!
//! Floating reads of mutable locations additionally walk the dominator path
//! from their earliest block down to that join and stop at the first block
//! past which some path would kill their location.

use super::earliest::EarliestPlacement;
use super::kill_set::KillSetAnalysis;
use super::{BlockAssignment, ScheduleContext, ScheduleStats, SchedulingStrategy};
use crate::error::ScheduleError;
use crate::graph::OperationKind;
use crate::ids::{BlockId, OpId};
use crate::location::LocationTag;
use fxhash::FxHashSet;
use log::{debug, trace};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Expanding,
    Done,
}

/// Live floating operations ordered so that every floating usage of an
/// operation comes before it. Dead usages are ignored.
fn usage_order(
    ctx: ScheduleContext<'_>,
    earliest: &EarliestPlacement,
) -> Result<Vec<OpId>, ScheduleError> {
    let graph = ctx.graph;
    let mut state = vec![VisitState::Unvisited; graph.capacity()];
    let mut order = Vec::new();
    let mut stack: Vec<(OpId, bool)> = Vec::new();

    for root in graph
        .iter()
        .filter(|op| !op.is_pinned() && earliest.is_live(op.id()))
        .map(|op| op.id())
    {
        if state[root.index()] != VisitState::Unvisited {
            continue;
        }
        stack.push((root, false));
        while let Some((op, expanded)) = stack.pop() {
            if expanded {
                state[op.index()] = VisitState::Done;
                order.push(op);
                continue;
            }
            match state[op.index()] {
                VisitState::Done => continue,
                VisitState::Expanding => {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "floating operations form a cycle through {}",
                        op
                    )))
                }
                VisitState::Unvisited => {}
            }
            state[op.index()] = VisitState::Expanding;
            stack.push((op, true));
            for &usage in graph.op(op).usages().iter().rev() {
                if graph.op(usage).is_pinned() || !earliest.is_live(usage) {
                    continue;
                }
                match state[usage.index()] {
                    VisitState::Unvisited => stack.push((usage, false)),
                    VisitState::Expanding => {
                        return Err(ScheduleError::MalformedGraph(format!(
                            "floating operations form a cycle through {} and {}",
                            op, usage
                        )))
                    }
                    VisitState::Done => {}
                }
            }
        }
    }

    Ok(order)
}

/// Blocks at which `usage` consumes `op`
fn effective_blocks(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    op: OpId,
    usage: OpId,
    out: &mut SmallVec<[BlockId; 4]>,
    seen: &mut FxHashSet<OpId>,
) {
    let graph = ctx.graph;
    let user = graph.op(usage);
    let Some(block) = placement.get(usage) else {
        return;
    };

    match user.kind() {
        kind if kind.is_merge() => {
            let preds = ctx.cfg.block(block).predecessors();
            let mut any = false;
            for position in graph.input_positions(usage, op) {
                if let Some(&pred) = preds.get(position) {
                    out.push(pred);
                    any = true;
                }
            }
            if !any {
                out.push(block);
            }
        }
        OperationKind::StateCapture => {
            if !seen.insert(usage) {
                return;
            }
            let before = out.len();
            for &consumer in user.usages() {
                effective_blocks(ctx, placement, usage, consumer, out, seen);
            }
            if out.len() == before {
                out.push(block);
            }
        }
        _ => out.push(block),
    }
}

/// Dominance join of every usage's effective block
fn usage_join(
    ctx: ScheduleContext<'_>,
    placement: &BlockAssignment,
    op: OpId,
) -> Option<BlockId> {
    let mut blocks: SmallVec<[BlockId; 4]> = SmallVec::new();
    let mut seen = FxHashSet::default();
    for &usage in ctx.graph.op(op).usages() {
        effective_blocks(ctx, placement, op, usage, &mut blocks, &mut seen);
    }
    blocks
        .into_iter()
        .reduce(|a, b| ctx.cfg.common_dominator(a, b))
}

/// Whether a kill of `location` lies on some path from `from` to `to` that
/// does not pass through `from` again.
///
/// Blocks forward-reachable from `from` and backward-reachable from `to`
/// are exactly the blocks of such paths.
fn kills_between(
    ctx: ScheduleContext<'_>,
    kill_sets: &mut KillSetAnalysis<'_>,
    from: BlockId,
    to: BlockId,
    location: LocationTag,
) -> bool {
    let cfg = ctx.cfg;

    let mut forward: FxHashSet<BlockId> = FxHashSet::default();
    let mut worklist: Vec<BlockId> = cfg.block(from).successors().to_vec();
    while let Some(block) = worklist.pop() {
        if block == from || !forward.insert(block) {
            continue;
        }
        worklist.extend_from_slice(cfg.block(block).successors());
    }

    let mut backward: FxHashSet<BlockId> = FxHashSet::default();
    let mut worklist: Vec<BlockId> = cfg.block(to).predecessors().to_vec();
    while let Some(block) = worklist.pop() {
        if block == from || !backward.insert(block) {
            continue;
        }
        worklist.extend_from_slice(cfg.block(block).predecessors());
    }

    let mut between: Vec<BlockId> = forward.intersection(&backward).copied().collect();
    between.sort();
    between
        .into_iter()
        .any(|block| kill_sets.kill_set(block).kills(location))
}

/// Memory-aware placement of a mutable read between `earliest` and `latest`
fn place_read(
    ctx: ScheduleContext<'_>,
    kill_sets: &mut KillSetAnalysis<'_>,
    stats: &mut ScheduleStats,
    read: OpId,
    location: LocationTag,
    earliest: BlockId,
    latest: BlockId,
) -> Result<BlockId, ScheduleError> {
    if earliest == latest {
        return Ok(earliest);
    }

    let access = ctx.graph.op(read).last_access();
    let upper = access
        .and_then(|a| ctx.graph.block_of(a))
        .unwrap_or_else(|| ctx.cfg.entry());

    let path = ctx
        .cfg
        .dominator_path(earliest, latest)
        .ok_or_else(|| ScheduleError::NoLegalBlock {
            op: read,
            reason: format!("earliest {} does not dominate latest {}", earliest, latest),
        })?;

    for (i, &current) in path.iter().enumerate() {
        let killed = match access {
            Some(access) if current == upper => kill_sets
                .kill_set_excluding(current, access)
                .kills(location),
            _ => kill_sets.kill_set(current).kills(location),
        };
        if current == latest {
            return Ok(latest);
        }
        if killed {
            trace!("{} stopped at {}: kills {}", read, current, location);
            stats.reads_stopped_by_kill += 1;
            return Ok(current);
        }

        let next = path[i + 1];
        let straight = ctx.cfg.is_successor(current, next)
            && ctx.cfg.block(next).predecessors().len() == 1;
        if !straight && kills_between(ctx, kill_sets, current, next, location) {
            trace!(
                "{} stopped at {}: a path to {} kills {}",
                read,
                current,
                next,
                location
            );
            stats.reads_stopped_by_kill += 1;
            return Ok(current);
        }
    }

    Ok(latest)
}

/// Move `block` up the dominator tree to the shallowest loop depth that
/// stays below `earliest`
fn hoist_out_of_loops(
    ctx: ScheduleContext<'_>,
    read_location: Option<LocationTag>,
    earliest: BlockId,
    block: BlockId,
) -> BlockId {
    let loops = ctx.loops;
    let earliest_depth = loops.loop_depth(earliest);
    let mut result = block;
    let mut current = block;

    while loops.loop_depth(current) > earliest_depth && current != earliest {
        if let Some(location) = read_location {
            if loops
                .loop_headed_by(current)
                .is_some_and(|lp| lp.can_kill(location))
            {
                break;
            }
        }
        let Some(dominator) = ctx.cfg.block(current).dominator() else {
            break;
        };
        if loops.loop_depth(dominator) < loops.loop_depth(result) {
            result = dominator;
        }
        current = dominator;
    }

    result
}

pub(crate) fn place_latest(
    ctx: ScheduleContext<'_>,
    earliest: &EarliestPlacement,
    kill_sets: &mut KillSetAnalysis<'_>,
    stats: &mut ScheduleStats,
) -> Result<BlockAssignment, ScheduleError> {
    let graph = ctx.graph;
    let cfg = ctx.cfg;
    let hoist = ctx.config.strategy == SchedulingStrategy::LatestOutOfLoops;
    let check_legality = cfg!(debug_assertions) || ctx.config.verify_schedule;

    let order = usage_order(ctx, earliest)?;
    let mut placement = BlockAssignment::with_pinned(graph);

    for op in order {
        let early = earliest.block_of(op).ok_or(ScheduleError::Unscheduled { op })?;
        let latest = usage_join(ctx, &placement, op).unwrap_or(early);
        if !cfg.dominates(early, latest) {
            return Err(ScheduleError::NoLegalBlock {
                op,
                reason: format!(
                    "earliest block {} does not dominate the usage join {}",
                    early, latest
                ),
            });
        }

        let read_location = graph.op(op).mutable_read_location();
        let mut block = match read_location {
            Some(location) => place_read(ctx, kill_sets, stats, op, location, early, latest)?,
            None => latest,
        };

        if hoist && block != early {
            let hoisted = hoist_out_of_loops(ctx, read_location, early, block);
            if hoisted != block {
                trace!("{} hoisted from {} to {}", op, block, hoisted);
                stats.operations_hoisted += 1;
                block = hoisted;
            }
        }

        if check_legality {
            if let Some(location) = read_location {
                let upper = graph
                    .op(op)
                    .last_access()
                    .and_then(|a| graph.block_of(a))
                    .unwrap_or_else(|| cfg.entry());
                if !cfg.dominates(upper, block) || !cfg.dominates(block, latest) {
                    return Err(ScheduleError::NoLegalBlock {
                        op,
                        reason: format!(
                            "read of {} placed in {} outside the range {}..{}",
                            location, block, upper, latest
                        ),
                    });
                }
            }
        }

        trace!("latest {} ({}): {} .. {} -> {}", op, graph.kind(op), early, latest, block);
        placement.place(op, block)?;
    }

    debug!(
        "latest placement: {} reads stopped by kills, {} operations hoisted",
        stats.reads_stopped_by_kill, stats.operations_hoisted
    );
    Ok(placement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScheduleInputBuilder;
    use crate::location::MemoryEffect;
    use crate::schedule::{earliest::place_earliest, ScheduleConfig};

    const L: LocationTag = LocationTag::Mutable(1);

    fn run(
        input: &crate::builder::ScheduleInput,
        strategy: SchedulingStrategy,
    ) -> (BlockAssignment, ScheduleStats) {
        let config = ScheduleConfig::development().with_strategy(strategy);
        let ctx = ScheduleContext {
            graph: &input.graph,
            cfg: &input.cfg,
            loops: &input.loops,
            config: &config,
        };
        let earliest = place_earliest(ctx).unwrap();
        let mut kill_sets = KillSetAnalysis::new(&input.graph, &input.cfg);
        let mut stats = ScheduleStats::default();
        let placement = place_latest(ctx, &earliest, &mut kill_sets, &mut stats).unwrap();
        (placement, stats)
    }

    #[test]
    fn test_phi_usage_counts_at_predecessor() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let left = b.block();
        let right = b.block();
        let merge = b.block();
        b.edge(entry, left);
        b.edge(entry, right);
        b.edge(left, merge);
        b.edge(right, merge);
        let c = b.constant();
        let one = b.constant();
        let value = b.value(&[c]);
        let phi = b.phi(merge, &[value, one]);
        b.terminator(entry, &[]);
        b.terminator(left, &[]);
        b.terminator(right, &[]);
        b.terminator(merge, &[phi]);
        let input = b.finish().unwrap();

        let (placement, _) = run(&input, SchedulingStrategy::Latest);
        assert_eq!(placement.get(value), Some(left));
        assert_eq!(placement.get(one), Some(right));
    }

    #[test]
    fn test_state_capture_usage_counts_at_consumer() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let body = b.block();
        b.edge(entry, body);
        let c = b.constant();
        let call = b.fixed(body, MemoryEffect::KillsAll, &[]);
        let state = b.state(&[c, call]);
        b.attach_state(call, state);
        b.terminator(entry, &[]);
        b.terminator(body, &[]);
        let input = b.finish().unwrap();

        let (placement, _) = run(&input, SchedulingStrategy::Latest);
        assert_eq!(placement.get(state), Some(body));
        assert_eq!(placement.get(c), Some(body));
    }

    #[test]
    fn test_read_stays_above_kill_in_straight_line() {
        // entry -> mid (kills L) -> exit (uses read)
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let mid = b.block();
        let exit = b.block();
        b.edge(entry, mid);
        b.edge(mid, exit);
        let init = b.kill(entry, L, &[]);
        let read = b.read(L, Some(init), &[]);
        b.kill(mid, L, &[]);
        b.terminator(entry, &[]);
        b.terminator(mid, &[]);
        b.terminator(exit, &[read]);
        let input = b.finish().unwrap();

        let (placement, stats) = run(&input, SchedulingStrategy::Latest);
        assert_eq!(placement.get(read), Some(mid));
        assert_eq!(stats.reads_stopped_by_kill, 1);
    }

    #[test]
    fn test_hoisting_leaves_loop() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let header = b.block();
        let body = b.block();
        let exit = b.block();
        b.edge(entry, header);
        b.edge(header, body);
        b.edge(body, header);
        b.edge(header, exit);
        let c = b.constant();
        let value = b.value(&[c]);
        b.fixed(body, MemoryEffect::None, &[value]);
        b.terminator(entry, &[]);
        b.terminator(header, &[]);
        b.terminator(body, &[]);
        b.terminator(exit, &[]);
        let input = b.finish().unwrap();

        let (latest, _) = run(&input, SchedulingStrategy::Latest);
        assert_eq!(latest.get(value), Some(body));

        let (hoisted, stats) = run(&input, SchedulingStrategy::LatestOutOfLoops);
        assert_eq!(hoisted.get(value), Some(entry));
        assert_eq!(hoisted.get(c), Some(entry));
        assert_eq!(stats.operations_hoisted, 1);
    }

    #[test]
    fn test_dead_usages_ignored() {
        let mut b = ScheduleInputBuilder::new();
        let entry = b.entry();
        let exit = b.block();
        b.edge(entry, exit);
        let c = b.constant();
        let used = b.value(&[c]);
        let unused = b.value(&[c]);
        b.terminator(entry, &[]);
        b.terminator(exit, &[used]);
        let input = b.finish().unwrap();

        let config = ScheduleConfig::development();
        let ctx = ScheduleContext {
            graph: &input.graph,
            cfg: &input.cfg,
            loops: &input.loops,
            config: &config,
        };
        let earliest = place_earliest(ctx).unwrap();
        let order = usage_order(ctx, &earliest).unwrap();
        assert_eq!(order, vec![used, c]);

        // The graph still holds the dead user; it must not pull c anywhere
        let (placement, _) = run(&input, SchedulingStrategy::Latest);
        assert_eq!(placement.get(c), Some(exit));
        assert_eq!(placement.get(unused), None);
    }
}
