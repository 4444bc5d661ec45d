//! Kill-Set Analysis
//!
//! `kill_set(block)` is the union of every location killed by the pinned
//! operations of a block, memory phis included. Results are memoized per
//! block for the duration of one scheduling run; the cache dies with the
//! analysis.

use crate::cfg::ControlFlowGraph;
use crate::graph::Graph;
use crate::ids::{BlockId, OpId};
use crate::location::KillSet;
use fxhash::FxHashMap;

pub struct KillSetAnalysis<'g> {
    graph: &'g Graph,
    cfg: &'g ControlFlowGraph,
    cache: FxHashMap<BlockId, KillSet>,
    hits: usize,
    misses: usize,
}

impl<'g> KillSetAnalysis<'g> {
    pub fn new(graph: &'g Graph, cfg: &'g ControlFlowGraph) -> Self {
        Self {
            graph,
            cfg,
            cache: FxHashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    /// Every location killed anywhere in `block`
    pub fn kill_set(&mut self, block: BlockId) -> &KillSet {
        if self.cache.contains_key(&block) {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        let (graph, cfg) = (self.graph, self.cfg);
        self.cache
            .entry(block)
            .or_insert_with(|| scan(graph, cfg.block(block).fixed_ops()))
    }

    /// Locations killed strictly after `exclude` in `block`.
    ///
    /// Used when a read's own last access lies in the block being measured.
    /// Falls back to the whole block when `exclude` is not in it. Never cached.
    pub fn kill_set_excluding(&self, block: BlockId, exclude: OpId) -> KillSet {
        let fixed = self.cfg.block(block).fixed_ops();
        match fixed.iter().position(|&op| op == exclude) {
            Some(pos) => scan(self.graph, &fixed[pos + 1..]),
            None => scan(self.graph, fixed),
        }
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    pub fn cache_misses(&self) -> usize {
        self.misses
    }
}

fn scan(graph: &Graph, ops: &[OpId]) -> KillSet {
    let mut set = KillSet::new();
    for &op in ops {
        graph.kind(op).collect_kills(&mut set);
        if set.is_all() {
            break;
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperationKind;
    use crate::location::{LocationTag, MemoryEffect};
    use smallvec::smallvec;

    const A: LocationTag = LocationTag::Mutable(1);
    const B: LocationTag = LocationTag::Mutable(2);
    const C: LocationTag = LocationTag::Mutable(3);

    #[test]
    fn test_kill_set_and_cache() {
        let mut cfg = ControlFlowGraph::new();
        let entry = cfg.add_block();
        let merge = cfg.add_block();
        cfg.add_edge(entry, merge);

        let mut graph = Graph::new();
        let first = graph.add(OperationKind::Fixed(MemoryEffect::KillsSingle(A)), &[]);
        let plain = graph.add(OperationKind::Fixed(MemoryEffect::None), &[]);
        let second = graph.add(OperationKind::Fixed(MemoryEffect::KillsMulti(smallvec![B, C])), &[]);
        cfg.append_fixed(&mut graph, entry, first).unwrap();
        cfg.append_fixed(&mut graph, entry, plain).unwrap();
        cfg.append_fixed(&mut graph, entry, second).unwrap();
        let memphi = graph.add(OperationKind::MemoryPhi(A), &[second]);
        cfg.append_fixed(&mut graph, merge, memphi).unwrap();

        let mut analysis = KillSetAnalysis::new(&graph, &cfg);
        assert!(analysis.kill_set(entry).kills(A));
        assert!(analysis.kill_set(entry).kills(C));
        assert_eq!(analysis.cache_misses(), 1);
        assert_eq!(analysis.cache_hits(), 1);

        // Memory phis kill their own location
        assert!(analysis.kill_set(merge).kills(A));
        assert!(!analysis.kill_set(merge).kills(B));

        let after_first = analysis.kill_set_excluding(entry, first);
        assert!(!after_first.kills(A));
        assert!(after_first.kills(B));
        assert!(analysis.kill_set_excluding(entry, second).is_empty());
        // Excluded op from another block: whole block counts
        assert!(analysis.kill_set_excluding(merge, first).kills(A));
    }

    #[test]
    fn test_kills_all_absorbs() {
        let mut cfg = ControlFlowGraph::new();
        let entry = cfg.add_block();
        let mut graph = Graph::new();
        let call = graph.add(OperationKind::Fixed(MemoryEffect::KillsAll), &[]);
        let store = graph.add(OperationKind::Fixed(MemoryEffect::KillsSingle(A)), &[]);
        cfg.append_fixed(&mut graph, entry, call).unwrap();
        cfg.append_fixed(&mut graph, entry, store).unwrap();

        let mut analysis = KillSetAnalysis::new(&graph, &cfg);
        assert!(analysis.kill_set(entry).is_all());
        assert!(analysis.kill_set(entry).kills(B));
        assert!(!analysis.kill_set_excluding(entry, call).kills(B));
    }
}
