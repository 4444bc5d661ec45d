//! Operation Graph
//!
//! Operations live in an arena owned by [`Graph`] and refer to each other by
//! [`OpId`]. Three kinds of edges exist:
//!
//! - ordered data `inputs`
//! - an optional `state_after` edge from a pinned operation to the
//!   [`OperationKind::StateCapture`] describing the state after it
//! - an optional `last_access` edge from a floating read to the pinned
//!   operation that last touched its location
//!
//! Every edge is mirrored by one entry in the target's usage list. The arena
//! keeps both directions in sync on every mutation, so usage lists are never
//! owned independently of the edges they describe.

use crate::error::ScheduleError;
use crate::ids::{BlockId, OpId};
use crate::location::{KillSet, LocationTag, MemoryEffect};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// What an operation is, as far as scheduling is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Pinned control-flow operation; a non-`None` effect makes it a memory kill
    Fixed(MemoryEffect),

    /// Block terminator (branch, return, ...), always last in its block
    Terminator,

    /// Value merge; input `i` arrives along predecessor edge `i` of its block
    Phi,

    /// Memory merge for one location, an implicit kill of that location
    MemoryPhi(LocationTag),

    /// Value leaving a loop, pinned to the loop exit block
    LoopExitProxy,

    /// Ordinary floating value
    Value,

    /// Floating read of a memory location
    FloatingRead(LocationTag),

    /// Floating deoptimization metadata
    StateCapture,
}

impl OperationKind {
    /// Pinned operations are bound to a block by CFG construction
    pub fn is_pinned(&self) -> bool {
        matches!(
            self,
            OperationKind::Fixed(_)
                | OperationKind::Terminator
                | OperationKind::Phi
                | OperationKind::MemoryPhi(_)
                | OperationKind::LoopExitProxy
        )
    }

    pub fn is_floating(&self) -> bool {
        !self.is_pinned()
    }

    /// Phi-like operations whose inputs are attributed to predecessor edges
    pub fn is_merge(&self) -> bool {
        matches!(self, OperationKind::Phi | OperationKind::MemoryPhi(_))
    }

    /// Whether this operation invalidates memory when executed
    pub fn is_kill(&self) -> bool {
        match self {
            OperationKind::Fixed(effect) => effect.is_kill(),
            OperationKind::MemoryPhi(_) => true,
            _ => false,
        }
    }

    /// Whether this operation invalidates reads of `location`
    pub fn kills(&self, location: LocationTag) -> bool {
        match self {
            OperationKind::Fixed(effect) => effect.kills(location),
            OperationKind::MemoryPhi(tag) => tag.overlaps(location),
            _ => false,
        }
    }

    /// Add whatever this operation kills to `set`
    pub fn collect_kills(&self, set: &mut KillSet) {
        match self {
            OperationKind::Fixed(effect) => set.add_effect(effect),
            OperationKind::MemoryPhi(tag) => set.insert(*tag),
            _ => {}
        }
    }

    /// Location read by a floating read
    pub fn read_location(&self) -> Option<LocationTag> {
        match self {
            OperationKind::FloatingRead(tag) => Some(*tag),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            OperationKind::Fixed(MemoryEffect::None) => "fixed",
            OperationKind::Fixed(_) => "kill",
            OperationKind::Terminator => "term",
            OperationKind::Phi => "phi",
            OperationKind::MemoryPhi(_) => "memphi",
            OperationKind::LoopExitProxy => "proxy",
            OperationKind::Value => "value",
            OperationKind::FloatingRead(_) => "read",
            OperationKind::StateCapture => "state",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Fixed(MemoryEffect::KillsAll) => write!(f, "kill[ANY]"),
            OperationKind::Fixed(effect) if effect.is_kill() => {
                let names: Vec<String> = effect.locations().iter().map(|t| t.to_string()).collect();
                write!(f, "kill[{}]", names.join(", "))
            }
            OperationKind::MemoryPhi(tag) => write!(f, "memphi[{}]", tag),
            OperationKind::FloatingRead(tag) => write!(f, "read[{}]", tag),
            other => write!(f, "{}", other.mnemonic()),
        }
    }
}

/// A node of the instruction graph
#[derive(Debug, Clone)]
pub struct Operation {
    id: OpId,
    kind: OperationKind,
    inputs: SmallVec<[OpId; 4]>,
    state_after: Option<OpId>,
    last_access: Option<OpId>,
    usages: Vec<OpId>,
    block: Option<BlockId>,
    deleted: bool,
}

impl Operation {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Ordered data inputs
    pub fn inputs(&self) -> &[OpId] {
        &self.inputs
    }

    pub fn state_after(&self) -> Option<OpId> {
        self.state_after
    }

    /// Last known memory access for a floating read
    pub fn last_access(&self) -> Option<OpId> {
        self.last_access
    }

    /// One entry per incoming edge from a user
    pub fn usages(&self) -> &[OpId] {
        &self.usages
    }

    /// Assigned block, unset for floating operations until scheduled
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_pinned(&self) -> bool {
        self.kind.is_pinned()
    }

    /// Location of a read that participates in kill reasoning
    pub fn mutable_read_location(&self) -> Option<LocationTag> {
        self.kind.read_location().filter(|tag| tag.is_mutable())
    }

    /// Every edge leaving this operation: data inputs, then state, then memory
    pub fn all_inputs(&self) -> impl Iterator<Item = OpId> + '_ {
        self.inputs
            .iter()
            .copied()
            .chain(self.state_after)
            .chain(self.last_access)
    }
}

/// Arena of operations
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: Vec<Operation>,
    live_count: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation with the given data inputs
    pub fn add(&mut self, kind: OperationKind, inputs: &[OpId]) -> OpId {
        let id = OpId::from_index(self.ops.len());
        for &input in inputs {
            self.ops[input.index()].usages.push(id);
        }
        self.ops.push(Operation {
            id,
            kind,
            inputs: SmallVec::from_slice(inputs),
            state_after: None,
            last_access: None,
            usages: Vec::new(),
            block: None,
            deleted: false,
        });
        self.live_count += 1;
        id
    }

    /// Attach the state capture describing the program state after `op`
    pub fn set_state_after(&mut self, op: OpId, state: OpId) -> Result<(), ScheduleError> {
        if !matches!(self.op(state).kind, OperationKind::StateCapture) {
            return Err(ScheduleError::MalformedGraph(format!(
                "state_after of {} must be a state capture, got {}",
                op,
                self.op(state).kind
            )));
        }
        if let Some(old) = self.ops[op.index()].state_after.replace(state) {
            self.remove_usage(old, op);
        }
        self.ops[state.index()].usages.push(op);
        Ok(())
    }

    /// Set the last known memory access of a floating read
    pub fn set_last_access(&mut self, read: OpId, access: OpId) -> Result<(), ScheduleError> {
        if self.op(read).kind.read_location().is_none() {
            return Err(ScheduleError::MalformedGraph(format!(
                "{} is not a floating read and cannot have a last access",
                read
            )));
        }
        if let Some(old) = self.ops[read.index()].last_access.replace(access) {
            self.remove_usage(old, read);
        }
        self.ops[access.index()].usages.push(read);
        Ok(())
    }

    /// Replace data input `index` of `user`
    pub fn replace_input(&mut self, user: OpId, index: usize, new_input: OpId) {
        let old = std::mem::replace(&mut self.ops[user.index()].inputs[index], new_input);
        self.remove_usage(old, user);
        self.ops[new_input.index()].usages.push(user);
    }

    fn remove_usage(&mut self, target: OpId, user: OpId) {
        let usages = &mut self.ops[target.index()].usages;
        if let Some(pos) = usages.iter().position(|&u| u == user) {
            usages.remove(pos);
        }
    }

    /// Panics on an id from another graph
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.index()]
    }

    pub fn get(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.index()).filter(|op| !op.deleted)
    }

    pub fn kind(&self, id: OpId) -> &OperationKind {
        &self.ops[id.index()].kind
    }

    pub fn block_of(&self, id: OpId) -> Option<BlockId> {
        self.ops[id.index()].block
    }

    pub(crate) fn set_block(&mut self, id: OpId, block: Option<BlockId>) {
        self.ops[id.index()].block = block;
    }

    /// Total arena size, including deleted slots
    pub fn capacity(&self) -> usize {
        self.ops.len()
    }

    /// Number of operations that have not been deleted
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Live operations in id order
    pub fn iter(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.ops.iter().filter(|op| !op.deleted)
    }

    pub fn ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.iter().map(|op| op.id)
    }

    /// Remove a set of operations that no live operation depends on.
    ///
    /// Edges from the removed operations are dropped from the usage lists of
    /// surviving inputs; the removed operations keep their slots but lose all
    /// edges.
    pub fn excise(&mut self, dead: &[OpId]) {
        for &id in dead {
            let targets: Vec<OpId> = self.ops[id.index()].all_inputs().collect();
            for target in targets {
                self.remove_usage(target, id);
            }
        }
        for &id in dead {
            let op = &mut self.ops[id.index()];
            if op.deleted {
                continue;
            }
            op.inputs.clear();
            op.state_after = None;
            op.last_access = None;
            op.usages.clear();
            op.block = None;
            op.deleted = true;
            self.live_count -= 1;
        }
    }

    /// Rebuild every usage list from the edges
    pub fn recompute_usages(&mut self) {
        for op in &mut self.ops {
            op.usages.clear();
        }
        for index in 0..self.ops.len() {
            if self.ops[index].deleted {
                continue;
            }
            let user = self.ops[index].id;
            let targets: SmallVec<[OpId; 8]> = self.ops[index].all_inputs().collect();
            for target in targets {
                self.ops[target.index()].usages.push(user);
            }
        }
    }

    /// How `user` consumes `op`: the positions of `op` among `user`'s data inputs
    pub fn input_positions(&self, user: OpId, op: OpId) -> impl Iterator<Item = usize> + '_ {
        self.ops[user.index()]
            .inputs
            .iter()
            .enumerate()
            .filter(move |(_, input)| **input == op)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usages_follow_edges() {
        let mut graph = Graph::new();
        let a = graph.add(OperationKind::Value, &[]);
        let b = graph.add(OperationKind::Value, &[a, a]);
        let kill = graph.add(OperationKind::Fixed(MemoryEffect::KillsAll), &[b]);
        let read = graph.add(OperationKind::FloatingRead(LocationTag::Mutable(1)), &[a]);
        graph.set_last_access(read, kill).unwrap();

        assert_eq!(graph.op(a).usages(), &[b, b, read]);
        assert_eq!(graph.op(kill).usages(), &[read]);
        assert_eq!(graph.op(read).all_inputs().collect::<Vec<_>>(), vec![a, kill]);

        let before: Vec<Vec<OpId>> = graph.iter().map(|op| op.usages().to_vec()).collect();
        graph.recompute_usages();
        let after: Vec<Vec<OpId>> = graph.iter().map(|op| op.usages().to_vec()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_excise_removes_edges() {
        let mut graph = Graph::new();
        let a = graph.add(OperationKind::Value, &[]);
        let b = graph.add(OperationKind::Value, &[a]);
        let c = graph.add(OperationKind::Value, &[b, a]);

        graph.excise(&[b, c]);
        assert!(graph.op(a).usages().is_empty());
        assert!(graph.get(b).is_none());
        assert!(graph.op(c).inputs().is_empty());
        assert_eq!(graph.live_count(), 1);
        assert_eq!(graph.ids().collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_state_after_requires_state_capture() {
        let mut graph = Graph::new();
        let fixed = graph.add(OperationKind::Fixed(MemoryEffect::None), &[]);
        let value = graph.add(OperationKind::Value, &[]);
        assert!(graph.set_state_after(fixed, value).is_err());

        let state = graph.add(OperationKind::StateCapture, &[fixed]);
        graph.set_state_after(fixed, state).unwrap();
        assert_eq!(graph.op(state).usages(), &[fixed]);
        assert_eq!(graph.op(fixed).usages(), &[state]);
    }

    #[test]
    fn test_replace_input() {
        let mut graph = Graph::new();
        let a = graph.add(OperationKind::Value, &[]);
        let b = graph.add(OperationKind::Value, &[]);
        let phi = graph.add(OperationKind::Phi, &[a, a]);
        graph.replace_input(phi, 1, b);
        assert_eq!(graph.op(phi).inputs(), &[a, b]);
        assert_eq!(graph.op(a).usages(), &[phi]);
        assert_eq!(graph.op(b).usages(), &[phi]);
        assert_eq!(graph.input_positions(phi, b).collect::<Vec<_>>(), vec![1]);
    }
}
