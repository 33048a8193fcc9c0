// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Realization order for resource nodes.
//!
//! [`resolve`] is a depth-first topological sort. Roots are visited in
//! declaration order and so are the dependencies of each node, which makes the
//! order stable for a given descriptor. A back edge aborts with
//! [`TopologyError::DependencyCycle`] naming the nodes on the cycle.
//!
//! [`waves`] splits a resolved order into groups that can be realized
//! concurrently: every node of wave `N` depends only on nodes of earlier waves.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{TopologyError, TopologyResult};
use crate::resources::ResourceNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Declared with `depends_on`.
    Explicit,
    /// Derived from an output reference or a group membership.
    Inferred,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::Inferred => f.write_str("inferred"),
        }
    }
}

/// `from` cannot be realized before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// Every edge of the graph. An edge both declared and inferred is reported as explicit.
pub fn edges(nodes: &[ResourceNode]) -> Vec<DependencyEdge> {
    let mut edges = Vec::new();
    for node in nodes {
        for dep in &node.explicit {
            edges.push(DependencyEdge {
                from: node.id.clone(),
                to: dep.clone(),
                kind: EdgeKind::Explicit,
            });
        }
        for dep in node.inferred.iter().filter(|dep| !node.explicit.contains(*dep)) {
            edges.push(DependencyEdge {
                from: node.id.clone(),
                to: dep.clone(),
                kind: EdgeKind::Inferred,
            });
        }
    }
    edges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// A node whose dependencies are being walked.
struct Frame {
    position: usize,
    deps: Vec<usize>,
    next: usize,
}

struct Sorter<'a> {
    nodes: &'a [ResourceNode],
    index: HashMap<&'a str, usize>,
    marks: Vec<Mark>,
    stack: Vec<usize>,
    order: Vec<usize>,
}

impl<'a> Sorter<'a> {
    fn new(nodes: &'a [ResourceNode]) -> TopologyResult<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), position).is_some() {
                return Err(TopologyError::ResourceConflict(format!(
                    "resource id {} is declared more than once",
                    node.id
                )));
            }
        }
        Ok(Self {
            nodes,
            index,
            marks: vec![Mark::Unvisited; nodes.len()],
            stack: Vec::new(),
            order: Vec::with_capacity(nodes.len()),
        })
    }

    /// Dependencies of `position`, in declaration order.
    fn dependencies(&self, position: usize) -> TopologyResult<Vec<usize>> {
        let node = &self.nodes[position];
        let mut deps = node
            .dependencies()
            .into_iter()
            .map(|dep| {
                self.index.get(dep).copied().ok_or_else(|| {
                    TopologyError::Descriptor(format!(
                        "resource {} depends on unknown resource {dep}",
                        node.id
                    ))
                })
            })
            .collect::<TopologyResult<Vec<usize>>>()?;
        deps.sort_unstable();
        Ok(deps)
    }

    fn cycle(&self, position: usize) -> TopologyError {
        let start = self
            .stack
            .iter()
            .position(|p| *p == position)
            .unwrap_or_default();
        let mut members: Vec<String> = self.stack[start..]
            .iter()
            .map(|p| self.nodes[*p].id.clone())
            .collect();
        members.push(self.nodes[position].id.clone());
        TopologyError::DependencyCycle { members }
    }

    fn enter(&mut self, position: usize, work: &mut Vec<Frame>) -> TopologyResult<()> {
        let deps = self.dependencies(position)?;
        self.marks[position] = Mark::InProgress;
        self.stack.push(position);
        work.push(Frame {
            position,
            deps,
            next: 0,
        });
        Ok(())
    }

    /// Depth-first from `root` on an explicit work stack.
    fn visit(&mut self, root: usize) -> TopologyResult<()> {
        if self.marks[root] != Mark::Unvisited {
            return Ok(());
        }
        let mut work = Vec::new();
        self.enter(root, &mut work)?;

        while let Some(frame) = work.last_mut() {
            let Some(&dep) = frame.deps.get(frame.next) else {
                let position = frame.position;
                work.pop();
                self.stack.pop();
                self.marks[position] = Mark::Done;
                self.order.push(position);
                continue;
            };
            frame.next += 1;
            match self.marks[dep] {
                Mark::Done => {}
                Mark::InProgress => return Err(self.cycle(dep)),
                Mark::Unvisited => self.enter(dep, &mut work)?,
            }
        }
        Ok(())
    }
}

/// Returns node ids in an order where every node follows all of its
/// explicit and inferred dependencies.
#[tracing::instrument(skip_all, fields(nodes = nodes.len()))]
pub fn resolve(nodes: &[ResourceNode]) -> TopologyResult<Vec<String>> {
    let mut sorter = Sorter::new(nodes)?;
    for position in 0..nodes.len() {
        sorter.visit(position)?;
    }
    let order: Vec<String> = sorter
        .order
        .iter()
        .map(|p| nodes[*p].id.clone())
        .collect();
    tracing::debug!("[resolver] order: {}", order.join(", "));
    Ok(order)
}

/// Groups a resolved `order` into waves of mutually independent nodes.
pub fn waves(nodes: &[ResourceNode], order: &[String]) -> Vec<Vec<String>> {
    let by_id: HashMap<&str, &ResourceNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut level: HashMap<&str, usize> = HashMap::with_capacity(order.len());
    let mut waves: Vec<Vec<String>> = Vec::new();

    for id in order {
        let depth = by_id
            .get(id.as_str())
            .map(|node| {
                node.dependencies()
                    .into_iter()
                    .filter_map(|dep| level.get(dep))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        level.insert(id.as_str(), depth);
        if waves.len() <= depth {
            waves.resize_with(depth + 1, Vec::new);
        }
        waves[depth].push(id.clone());
    }
    waves
}
