//! Schedule Dump Utility
//!
//! Pretty-prints a finished schedule block by block, and exports it as JSON
//! for external graph viewers.

use crate::cfg::ControlFlowGraph;
use crate::graph::Graph;
use crate::ids::{BlockId, OpId};
use crate::loops::LoopForest;
use crate::schedule::{Schedule, ScheduleStats};
use serde::Serialize;
use std::fmt;

/// Display adapter for a schedule
pub struct ScheduleDump<'a> {
    pub schedule: &'a Schedule,
    pub graph: &'a Graph,
    pub cfg: &'a ControlFlowGraph,
    pub loops: &'a LoopForest,
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl<'a> ScheduleDump<'a> {
    fn write_op(&self, f: &mut fmt::Formatter<'_>, op: OpId) -> fmt::Result {
        let operation = self.graph.op(op);
        write!(f, "    {} = {}", op, operation.kind())?;
        if !operation.inputs().is_empty() {
            write!(f, " {}", join(operation.inputs()))?;
        }
        if let Some(access) = operation.last_access() {
            write!(f, " after {}", access)?;
        }
        if let Some(state) = operation.state_after() {
            write!(f, " state {}", state)?;
        }
        writeln!(f)
    }

    fn write_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId, ops: &[OpId]) -> fmt::Result {
        let info = self.cfg.block(block);
        let label = info
            .label
            .as_ref()
            .map(|l| format!(" ; {}", l))
            .unwrap_or_default();
        writeln!(f, "  {}:{}", block, label)?;

        if !info.predecessors().is_empty() {
            writeln!(f, "    ; preds: {}", join(info.predecessors()))?;
        }
        if let Some(dom) = info.dominator() {
            writeln!(f, "    ; idom: {}", dom)?;
        }
        let depth = self.loops.loop_depth(block);
        if depth > 0 {
            let header = if self.loops.is_loop_header(block) {
                ", header"
            } else {
                ""
            };
            writeln!(f, "    ; loop depth: {}{}", depth, header)?;
        }

        for &op in ops {
            self.write_op(f, op)?;
        }

        if !info.successors().is_empty() {
            writeln!(f, "    ; succs: {}", join(info.successors()))?;
        }
        Ok(())
    }
}

impl fmt::Display for ScheduleDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.schedule.stats();
        writeln!(
            f,
            "; schedule: {} blocks, {} operations ({} dead removed, {} hoisted)",
            self.cfg.len(),
            stats.operations_scheduled,
            stats.dead_operations_removed,
            stats.operations_hoisted
        )?;
        for (block, ops) in self.schedule.blocks() {
            self.write_block(f, block, ops)?;
        }
        Ok(())
    }
}

/// Dump a schedule to a string
pub fn dump_schedule(
    schedule: &Schedule,
    graph: &Graph,
    cfg: &ControlFlowGraph,
    loops: &LoopForest,
) -> String {
    ScheduleDump {
        schedule,
        graph,
        cfg,
        loops,
    }
    .to_string()
}

#[derive(Serialize)]
struct JsonOperation {
    id: OpId,
    kind: String,
    inputs: Vec<OpId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_access: Option<OpId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_after: Option<OpId>,
}

#[derive(Serialize)]
struct JsonBlock {
    id: BlockId,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    predecessors: Vec<BlockId>,
    successors: Vec<BlockId>,
    dominator: Option<BlockId>,
    loop_depth: u32,
    operations: Vec<JsonOperation>,
}

#[derive(Serialize)]
struct JsonSchedule<'a> {
    blocks: Vec<JsonBlock>,
    stats: &'a ScheduleStats,
}

/// Export a schedule as pretty-printed JSON
pub fn schedule_to_json(
    schedule: &Schedule,
    graph: &Graph,
    cfg: &ControlFlowGraph,
    loops: &LoopForest,
) -> serde_json::Result<String> {
    let blocks = schedule
        .blocks()
        .map(|(block, ops)| {
            let info = cfg.block(block);
            JsonBlock {
                id: block,
                label: info.label.clone(),
                predecessors: info.predecessors().to_vec(),
                successors: info.successors().to_vec(),
                dominator: info.dominator(),
                loop_depth: loops.loop_depth(block),
                operations: ops
                    .iter()
                    .map(|&op| {
                        let operation = graph.op(op);
                        JsonOperation {
                            id: op,
                            kind: operation.kind().to_string(),
                            inputs: operation.inputs().to_vec(),
                            last_access: operation.last_access(),
                            state_after: operation.state_after(),
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    serde_json::to_string_pretty(&JsonSchedule {
        blocks,
        stats: schedule.stats(),
    })
}
