//! Flush operation ordering.
//!
//! Pending work is a set of operations (one per dirty object) and the
//! dependencies between them:
//! - INSERT parent-first: an object is inserted after every unsaved object it
//!   references
//! - DELETE child-first: an object is deleted before the objects it
//!   references
//! - explicit ordering hints registered with
//!   [`Store::add_flush_order`](crate::Store::add_flush_order)
//!
//! Without dependencies, inserts run before updates, updates before deletes,
//! and operations of the same kind keep the order in which the objects were
//! first touched. A cycle is broken by inserting one nullable foreign key as
//! NULL and patching it afterwards; a cycle without such an edge is a
//! `FlushCycleError`.

use crate::arena::ObjectId;
use keel_core::{Error, FlushCycleError, Result};
use std::collections::{BTreeSet, HashSet};

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// One object's pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOp {
    pub id: ObjectId,
    pub kind: OpKind,
}

/// How strictly a dependency must be honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Must hold; part of a cycle means the flush fails.
    Hard,
    /// A nullable reference of the `after` object; a cycle through it can be
    /// broken by inserting NULL and patching the column later.
    Nullable(String),
    /// Preferred but droppable, used for delete ordering.
    Soft,
}

/// `before` must execute before `after` (indices into the op list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub before: usize,
    pub after: usize,
    pub kind: EdgeKind,
}

/// A statement to issue during flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushStep {
    /// Insert with the foreign keys of `null_refs` written as NULL.
    Insert {
        id: ObjectId,
        null_refs: Vec<String>,
    },
    Update {
        id: ObjectId,
    },
    Delete {
        id: ObjectId,
    },
    /// Write a reference deferred by an earlier insert.
    Patch {
        id: ObjectId,
        reference: String,
    },
}

impl FlushStep {
    pub fn id(&self) -> ObjectId {
        match self {
            FlushStep::Insert { id, .. }
            | FlushStep::Update { id }
            | FlushStep::Delete { id }
            | FlushStep::Patch { id, .. } => *id,
        }
    }
}

/// Ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    pub steps: Vec<FlushStep>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

struct Deferral {
    source: usize,
    target: usize,
    reference: String,
}

/// Order `ops` so that every surviving dependency holds.
///
/// `describe` renders an object for the cycle error.
pub fn order(
    ops: &[PendingOp],
    deps: &[Dependency],
    describe: impl Fn(ObjectId) -> String,
) -> Result<FlushPlan> {
    let mut active: Vec<bool> = deps
        .iter()
        .map(|d| d.before < ops.len() && d.after < ops.len())
        .collect();
    let mut deferrals: Vec<Deferral> = Vec::new();

    let sorted = loop {
        match kahn(ops, deps, &active) {
            Ok(sorted) => break sorted,
            Err(remaining) => {
                let cycle = find_cycle(deps, &active, &remaining);
                let breakable = cycle
                    .iter()
                    .copied()
                    .find(|&e| deps[e].kind == EdgeKind::Soft)
                    .or_else(|| {
                        cycle.iter().copied().find(|&e| {
                            matches!(deps[e].kind, EdgeKind::Nullable(_))
                                && ops[deps[e].after].kind == OpKind::Insert
                        })
                    });
                let Some(edge) = breakable else {
                    let objects = cycle
                        .iter()
                        .map(|&e| describe(ops[deps[e].after].id))
                        .collect();
                    return Err(Error::FlushCycle(FlushCycleError { objects }));
                };
                active[edge] = false;
                if let EdgeKind::Nullable(reference) = &deps[edge].kind {
                    tracing::debug!(
                        object = %describe(ops[deps[edge].after].id),
                        reference = %reference,
                        "Deferring reference to break insert cycle"
                    );
                    deferrals.push(Deferral {
                        source: deps[edge].after,
                        target: deps[edge].before,
                        reference: reference.clone(),
                    });
                }
            }
        }
    };

    let mut done: HashSet<usize> = HashSet::new();
    let mut patched = vec![false; deferrals.len()];
    let mut steps = Vec::with_capacity(sorted.len() + deferrals.len());
    for idx in sorted {
        let op = ops[idx];
        steps.push(match op.kind {
            OpKind::Insert => FlushStep::Insert {
                id: op.id,
                null_refs: deferrals
                    .iter()
                    .filter(|d| d.source == idx)
                    .map(|d| d.reference.clone())
                    .collect(),
            },
            OpKind::Update => FlushStep::Update { id: op.id },
            OpKind::Delete => FlushStep::Delete { id: op.id },
        });
        done.insert(idx);
        for (i, d) in deferrals.iter().enumerate() {
            if !patched[i] && done.contains(&d.source) && done.contains(&d.target) {
                patched[i] = true;
                steps.push(FlushStep::Patch {
                    id: ops[d.source].id,
                    reference: d.reference.clone(),
                });
            }
        }
    }
    Ok(FlushPlan { steps })
}

/// Topological sort. Ready operations are taken by kind, then by position.
/// On a cycle, returns the indices that could not be placed.
fn kahn(
    ops: &[PendingOp],
    deps: &[Dependency],
    active: &[bool],
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut indegree = vec![0usize; ops.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (e, dep) in deps.iter().enumerate() {
        if active[e] {
            indegree[dep.after] += 1;
            outgoing[dep.before].push(dep.after);
        }
    }

    let mut ready: BTreeSet<(OpKind, usize)> = ops
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, op)| (op.kind, i))
        .collect();
    let mut sorted = Vec::with_capacity(ops.len());
    while let Some(next) = ready.pop_first() {
        let idx = next.1;
        sorted.push(idx);
        for &to in &outgoing[idx] {
            indegree[to] -= 1;
            if indegree[to] == 0 {
                ready.insert((ops[to].kind, to));
            }
        }
    }

    if sorted.len() == ops.len() {
        Ok(sorted)
    } else {
        Err((0..ops.len()).filter(|i| indegree[*i] > 0).collect())
    }
}

/// Edge indices of one cycle among `remaining` nodes, in forward order.
///
/// Every remaining node still has a predecessor among the remaining nodes,
/// so walking predecessors always closes a cycle.
fn find_cycle(deps: &[Dependency], active: &[bool], remaining: &[usize]) -> Vec<usize> {
    let in_remaining: HashSet<usize> = remaining.iter().copied().collect();
    let edge_into = |node: usize| {
        deps.iter()
            .enumerate()
            .find(|(e, d)| active[*e] && d.after == node && in_remaining.contains(&d.before))
            .map(|(e, _)| e)
    };

    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut nodes = vec![start];
    let mut edges: Vec<usize> = Vec::new();
    let mut node = start;
    while let Some(edge) = edge_into(node) {
        let prev = deps[edge].before;
        edges.push(edge);
        if let Some(pos) = nodes.iter().position(|&n| n == prev) {
            let mut cycle = edges.split_off(pos);
            cycle.reverse();
            return cycle;
        }
        nodes.push(prev);
        node = prev;
    }
    edges
}
