//! Phase graph construction and ordering.
//!
//! Phases run in `ordinal` order unless `depends_on` edges say otherwise.
//! The builder validates the edges and produces a deterministic execution
//! order: a topological sort that always picks the lowest-ordinal ready phase.

use crate::errors::DefinitionError;
use crate::phase::Phase;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Index into the phase list.
pub type PhaseIndex = usize;

/// A validated, acyclic graph of phases.
#[derive(Debug)]
pub struct PhaseGraph {
    phases: Vec<Phase>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    /// Phases that depend on the given phase.
    fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phase ids in execution order.
    ///
    /// Kahn's algorithm with a min-heap keyed on `(ordinal, declaration index)`,
    /// so the order is total and reproducible.
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|d| d.len()).collect();
        let mut ready: BinaryHeap<Reverse<(u32, PhaseIndex)>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| Reverse((self.phases[i].ordinal, i)))
            .collect();

        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(self.phases[node].id.clone());
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse((self.phases[dependent].ordinal, dependent)));
                }
            }
        }
        order
    }
}

/// Builder for phase graphs.
pub struct DagBuilder {
    phases: Vec<Phase>,
}

impl DagBuilder {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Build the graph, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn build(self) -> Result<PhaseGraph, DefinitionError> {
        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.insert(phase.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicatePhase(phase.id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| DefinitionError::UnknownDependency {
                            phase: phase.id.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;
        Ok(graph)
    }

    fn validate_no_cycles(graph: &PhaseGraph) -> Result<(), DefinitionError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|d| d.len()).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.phases.len() {
            let mut involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.phases.get(i).map(|p| p.id.clone()))
                .collect();
            involved.sort();
            return Err(DefinitionError::Cycle(involved));
        }
        Ok(())
    }
}
