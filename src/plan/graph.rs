// Dependency graph builder
//
// Validates the step references of a plan and derives the execution order with
// Kahn's algorithm. Among steps that are ready at the same time the one declared
// first runs first, so the order is stable across runs.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use super::{DeploymentPlan, OutputField, StepKind};
use crate::error::PlanError;

/// Step dependencies of one plan, indexed by declaration position
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    /// `dependencies[i]` holds the positions step `i` waits for
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate ids, unknown or undeclared
    /// references and output fields the referenced step cannot produce
    pub fn build(plan: &DeploymentPlan) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(plan.steps.len());
        for (position, step) in plan.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), position).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }

        let mut dependencies = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let mut edges = BTreeSet::new();

            for dependency in &step.depends_on {
                let position = index.get(dependency.as_str()).ok_or_else(|| PlanError::UnknownReference {
                    step: step.id.clone(),
                    reference: dependency.clone(),
                })?;
                edges.insert(*position);
            }

            for reference in step.references() {
                let position = *index.get(reference.step.as_str()).ok_or_else(|| PlanError::UnknownReference {
                    step: step.id.clone(),
                    reference: reference.step.clone(),
                })?;

                if !step.depends_on.iter().any(|d| d == &reference.step) {
                    return Err(PlanError::UndeclaredDependency {
                        step: step.id.clone(),
                        reference: reference.step.clone(),
                    });
                }

                let target = &plan.steps[position];
                if reference.field == OutputField::Implementation && target.kind != StepKind::ProxyDeploy {
                    return Err(PlanError::InvalidOutputField {
                        step: step.id.clone(),
                        reference: reference.step.clone(),
                        field: reference.field,
                    });
                }
            }

            dependencies.push(edges);
        }

        Ok(Self {
            ids: plan.steps.iter().map(|step| step.id.clone()).collect(),
            dependencies,
        })
    }

    /// Ids `step` depends on, in declaration order
    pub fn dependencies_of(&self, step: &str) -> Vec<&str> {
        self.ids
            .iter()
            .position(|id| id == step)
            .map(|position| {
                self.dependencies[position]
                    .iter()
                    .map(|&dep| self.ids[dep].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topological order of the step ids
    pub fn order(&self) -> Result<Vec<String>, PlanError> {
        let count = self.ids.len();
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (step, edges) in self.dependencies.iter().enumerate() {
            for &dependency in edges {
                dependents[dependency].push(step);
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < count {
            let cycle = self.find_cycle(&remaining);
            return Err(PlanError::CyclicDependency { cycle });
        }

        let order: Vec<String> = order.into_iter().map(|i| self.ids[i].clone()).collect();
        debug!("Execution order: {}", order.join(", "));
        Ok(order)
    }

    /// Walk unresolved dependencies from the first stuck step until a step
    /// repeats. Every stuck step has at least one stuck dependency, so the walk
    /// always closes.
    fn find_cycle(&self, remaining: &[usize]) -> Vec<String> {
        let stuck = |i: usize| remaining[i] > 0;
        let Some(start) = (0..self.ids.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(next) = self.dependencies[current].iter().copied().find(|&d| stuck(d)) else {
                break;
            };
            if let Some(begin) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> = path[begin..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }

        path.into_iter().map(|i| self.ids[i].clone()).collect()
    }
}

/// Validate `plan` and return its step ids in execution order
pub fn execution_order(plan: &DeploymentPlan) -> Result<Vec<String>, PlanError> {
    DependencyGraph::build(plan)?.order()
}
