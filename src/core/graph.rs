//! Trigger graph between builders
//!
//! Nodes are builders. Every trigger step contributes one edge per
//! (scheduler, target builder) pair it can start.

use crate::core::{builder::Builder, schedulers::Scheduler, step::StepAction};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A directed edge from a builder's trigger step to a builder it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEdge {
    /// Calling builder
    pub from: String,

    /// Trigger step in the calling builder
    pub step: String,

    /// Scheduler the step fires
    pub scheduler: String,

    /// Builder started through the scheduler
    pub to: String,

    /// Caller waits for the child
    pub sync: bool,

    /// Keys copied from the caller's bag
    pub copy: Vec<String>,

    /// Keys computed by the caller and set on the child
    pub overrides: Vec<String>,

    /// Trigger step runs even after the caller halted
    pub always_run: bool,
}

/// A node of an unfolded call tree
#[derive(Debug, Clone)]
pub struct CallNode {
    pub builder: String,

    /// Edge that led here (None at the root)
    pub via: Option<TriggerEdge>,

    /// Builder already appears above this node; children are not expanded
    pub recursive: bool,

    pub children: Vec<CallNode>,
}

#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    builders: Vec<String>,
    edges: Vec<TriggerEdge>,
}

impl JobGraph {
    /// Build the graph; trigger references to unknown schedulers are ignored
    pub fn build(builders: &[Builder], schedulers: &[Scheduler]) -> Self {
        let by_name: HashMap<&str, &Scheduler> =
            schedulers.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut edges = Vec::new();
        for builder in builders {
            for step in &builder.steps {
                let StepAction::Trigger(spec) = &step.action else {
                    continue;
                };
                for scheduler_name in &spec.schedulers {
                    let Some(scheduler) = by_name.get(scheduler_name.as_str()) else {
                        continue;
                    };
                    for target in &scheduler.builders {
                        edges.push(TriggerEdge {
                            from: builder.name.clone(),
                            step: step.name.clone(),
                            scheduler: scheduler.name.clone(),
                            to: target.clone(),
                            sync: spec.wait_for_finish,
                            copy: spec.copy_properties.clone(),
                            overrides: spec.set_properties.keys().cloned().collect(),
                            always_run: step.policy.always_run,
                        });
                    }
                }
            }
        }

        JobGraph {
            builders: builders.iter().map(|b| b.name.clone()).collect(),
            edges,
        }
    }

    pub fn builders(&self) -> &[String] {
        &self.builders
    }

    pub fn edges(&self) -> &[TriggerEdge] {
        &self.edges
    }

    /// Outgoing edges of a builder, in step order
    pub fn edges_from(&self, builder: &str) -> Vec<&TriggerEdge> {
        self.edges.iter().filter(|e| e.from == builder).collect()
    }

    /// Builders that can trigger the given builder
    pub fn callers_of(&self, builder: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.to == builder && seen.insert(e.from.as_str()))
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Builders nobody triggers
    pub fn roots(&self) -> Vec<&str> {
        self.builders
            .iter()
            .filter(|b| !self.edges.iter().any(|e| &e.to == *b))
            .map(String::as_str)
            .collect()
    }

    /// Unfold the call tree below a builder
    pub fn call_tree(&self, root: &str) -> CallNode {
        let mut path = Vec::new();
        self.unfold(root, None, &mut path)
    }

    fn unfold(&self, builder: &str, via: Option<TriggerEdge>, path: &mut Vec<String>) -> CallNode {
        if path.iter().any(|b| b == builder) {
            return CallNode {
                builder: builder.to_string(),
                via,
                recursive: true,
                children: Vec::new(),
            };
        }

        path.push(builder.to_string());
        let children = self
            .edges_from(builder)
            .into_iter()
            .map(|edge| self.unfold(&edge.to, Some(edge.clone()), path))
            .collect();
        path.pop();

        CallNode {
            builder: builder.to_string(),
            via,
            recursive: false,
            children,
        }
    }

    /// Find a cycle made only of synchronous edges
    ///
    /// Such a cycle would make a run wait on itself. Returns the builders
    /// along the cycle, first builder repeated at the end.
    pub fn find_sync_cycle(&self) -> Option<Vec<String>> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in self.edges.iter().filter(|e| e.sync) {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for builder in &self.builders {
            if !visited.contains(builder.as_str()) {
                if let Some(cycle) = Self::dfs(builder, &adjacency, &mut visited, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs<'a>(
        node: &'a str,
        adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);

        for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(pos) = stack.iter().position(|b| *b == next) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|b| b.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            if !visited.contains(next) {
                if let Some(cycle) = Self::dfs(next, adjacency, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }
}
