//! Loop Forest
//!
//! Natural loop detection via back-edge identification, loop nesting, and
//! per-loop kill summaries used when hoisting operations out of loops.

use crate::cfg::ControlFlowGraph;
use crate::graph::Graph;
use crate::ids::{BlockId, LoopId};
use crate::location::{KillSet, LocationTag};
use fxhash::FxHashSet;

/// A natural loop in the control flow graph.
///
/// A natural loop is defined by its back edges (edges from B to H where H
/// dominates B). The loop header is H, and the loop body contains all blocks
/// from which a back-edge source can be reached without going through H.
#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,

    /// Loop header block (entry point of the loop)
    pub header: BlockId,

    /// Sources of the back edges into the header
    pub back_edge_sources: Vec<BlockId>,

    /// All blocks in the loop body (including header), sorted
    pub blocks: Vec<BlockId>,

    /// Nesting depth (1 = outermost loop)
    pub depth: u32,

    /// Immediately enclosing loop
    pub parent: Option<LoopId>,

    /// Every location some block of the loop may kill
    pub kills: KillSet,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.binary_search(&block).is_ok()
    }

    /// Whether an iteration of this loop may invalidate reads of `location`
    pub fn can_kill(&self, location: LocationTag) -> bool {
        self.kills.kills(location)
    }
}

/// All loops of a compilation unit
#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: Vec<Loop>,
    block_to_loop: Vec<Option<LoopId>>,
}

impl LoopForest {
    /// Detect loops; requires dominators. Records each block's innermost
    /// loop on the CFG as well.
    pub fn analyze(cfg: &mut ControlFlowGraph) -> Self {
        let mut headers: Vec<BlockId> = Vec::new();
        let mut sources: Vec<Vec<BlockId>> = Vec::new();

        // Back edges, grouped by header in RPO so outer headers come first
        for &header in cfg.reverse_postorder() {
            let back_edges: Vec<BlockId> = cfg
                .block(header)
                .predecessors()
                .iter()
                .copied()
                .filter(|&pred| cfg.dominates(header, pred))
                .collect();
            if !back_edges.is_empty() {
                headers.push(header);
                sources.push(back_edges);
            }
        }

        let mut loops: Vec<Loop> = Vec::with_capacity(headers.len());
        for (index, (header, back_edge_sources)) in headers.into_iter().zip(sources).enumerate() {
            let mut blocks = Self::find_loop_blocks(cfg, header, &back_edge_sources);
            blocks.sort();
            loops.push(Loop {
                id: LoopId::from_index(index),
                header,
                back_edge_sources,
                blocks,
                depth: 1,
                parent: None,
                kills: KillSet::new(),
            });
        }

        // Parent = smallest other loop containing this loop's header
        for index in 0..loops.len() {
            let header = loops[index].header;
            let parent = loops
                .iter()
                .filter(|other| other.header != header && other.contains(header))
                .min_by_key(|other| other.blocks.len())
                .map(|other| other.id);
            loops[index].parent = parent;
        }

        // Parents precede children in RPO order of headers
        for index in 0..loops.len() {
            if let Some(parent) = loops[index].parent {
                loops[index].depth = loops[parent.index()].depth + 1;
            }
        }

        let mut block_to_loop: Vec<Option<LoopId>> = vec![None; cfg.len()];
        for lp in &loops {
            for &block in &lp.blocks {
                let slot = &mut block_to_loop[block.index()];
                let deeper = match *slot {
                    Some(existing) => lp.depth > loops[existing.index()].depth,
                    None => true,
                };
                if deeper {
                    *slot = Some(lp.id);
                }
            }
        }

        for (index, &innermost) in block_to_loop.iter().enumerate() {
            cfg.set_loop(BlockId::from_index(index), innermost);
        }

        Self {
            loops,
            block_to_loop,
        }
    }

    /// Find all blocks in a natural loop given header and back edge sources
    fn find_loop_blocks(
        cfg: &ControlFlowGraph,
        header: BlockId,
        back_edge_sources: &[BlockId],
    ) -> Vec<BlockId> {
        let mut loop_blocks = FxHashSet::default();
        loop_blocks.insert(header);

        // Work backwards from the back edge sources to find all blocks that can reach header
        let mut worklist: Vec<BlockId> = Vec::new();
        for &source in back_edge_sources {
            if loop_blocks.insert(source) {
                worklist.push(source);
            }
        }
        while let Some(block) = worklist.pop() {
            for &pred in cfg.block(block).predecessors() {
                if loop_blocks.insert(pred) {
                    worklist.push(pred);
                }
            }
        }

        loop_blocks.into_iter().collect()
    }

    /// Summarize what each loop may kill from the pinned operations of its blocks
    pub fn summarize_kills(&mut self, graph: &Graph, cfg: &ControlFlowGraph) {
        for lp in &mut self.loops {
            let mut kills = KillSet::new();
            for &block in &lp.blocks {
                for &op in cfg.block(block).fixed_ops() {
                    graph.kind(op).collect_kills(&mut kills);
                }
            }
            lp.kills = kills;
        }
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Innermost loop containing `block`
    pub fn loop_of(&self, block: BlockId) -> Option<&Loop> {
        self.block_to_loop
            .get(block.index())
            .copied()
            .flatten()
            .map(|id| &self.loops[id.index()])
    }

    /// Loop nesting depth for a block (0 if not in any loop)
    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.loop_of(block).map(|lp| lp.depth).unwrap_or(0)
    }

    /// The loop headed by `block`, if any
    pub fn loop_headed_by(&self, block: BlockId) -> Option<&Loop> {
        self.loop_of(block).filter(|lp| lp.header == block)
    }

    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loop_headed_by(block).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperationKind;
    use crate::location::MemoryEffect;

    // entry -> outer -> inner <-> inner_body
    //            ^        |
    //            +--- latch     outer -> exit
    fn nested() -> (ControlFlowGraph, [BlockId; 6]) {
        let mut cfg = ControlFlowGraph::new();
        let entry = cfg.add_block();
        let outer = cfg.add_block();
        let inner = cfg.add_block();
        let inner_body = cfg.add_block();
        let latch = cfg.add_block();
        let exit = cfg.add_block();
        cfg.add_edge(entry, outer);
        cfg.add_edge(outer, inner);
        cfg.add_edge(outer, exit);
        cfg.add_edge(inner, inner_body);
        cfg.add_edge(inner_body, inner);
        cfg.add_edge(inner, latch);
        cfg.add_edge(latch, outer);
        cfg.compute_dominators().unwrap();
        (cfg, [entry, outer, inner, inner_body, latch, exit])
    }

    #[test]
    fn test_nested_loop_detection() {
        let (mut cfg, [entry, outer, inner, inner_body, latch, exit]) = nested();
        let forest = LoopForest::analyze(&mut cfg);

        assert_eq!(forest.len(), 2);
        assert!(forest.is_loop_header(outer));
        assert!(forest.is_loop_header(inner));
        assert!(!forest.is_loop_header(inner_body));

        let outer_loop = forest.loop_headed_by(outer).unwrap();
        assert_eq!(outer_loop.depth, 1);
        assert!(outer_loop.contains(latch));
        assert!(outer_loop.contains(inner_body));
        assert!(!outer_loop.contains(exit));

        let inner_loop = forest.loop_headed_by(inner).unwrap();
        assert_eq!(inner_loop.parent, Some(outer_loop.id));
        assert_eq!(inner_loop.back_edge_sources, vec![inner_body]);

        assert_eq!(forest.loop_depth(entry), 0);
        assert_eq!(forest.loop_depth(latch), 1);
        assert_eq!(forest.loop_depth(inner_body), 2);
        assert_eq!(cfg.block(inner_body).loop_id(), Some(inner_loop.id));
    }

    #[test]
    fn test_kill_summary() {
        let (mut cfg, [_, _, _, inner_body, latch, _]) = nested();
        let mut graph = Graph::new();
        let store = graph.add(
            OperationKind::Fixed(MemoryEffect::KillsSingle(LocationTag::Mutable(3))),
            &[],
        );
        cfg.append_fixed(&mut graph, inner_body, store).unwrap();
        let call = graph.add(OperationKind::Fixed(MemoryEffect::None), &[]);
        cfg.append_fixed(&mut graph, latch, call).unwrap();

        let mut forest = LoopForest::analyze(&mut cfg);
        forest.summarize_kills(&graph, &cfg);

        let inner_loop = forest.loop_of(inner_body).unwrap();
        assert!(inner_loop.can_kill(LocationTag::Mutable(3)));
        assert!(!inner_loop.can_kill(LocationTag::Mutable(4)));
        let outer_loop = forest.loop_of(latch).unwrap();
        assert!(outer_loop.can_kill(LocationTag::Mutable(3)));
    }
}
