//! Step Graph Builder
//!
//! Records the steps of one logical operation as an explicit DAG. Nodes keep
//! insertion order; edges come from each step's [`WaitFor`]. The graph is only
//! linearized when the workflow is submitted for execution.

use super::invocation::Invocation;
use crate::domain::model::ResourceId;
use crate::error::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

// =============================================================================
// Tokens
// =============================================================================

/// Handle of a step, returned by step creation and used to order later steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepToken(Uuid);

impl StepToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for StepToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Predecessors a step waits for. Empty means the step is a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitFor(Vec<StepToken>);

impl WaitFor {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn step(token: StepToken) -> Self {
        Self(vec![token])
    }

    /// Fan-in over several predecessors
    pub fn all(tokens: impl IntoIterator<Item = StepToken>) -> Self {
        let mut deduped = Vec::new();
        for token in tokens {
            if !deduped.contains(&token) {
                deduped.push(token);
            }
        }
        Self(deduped)
    }

    pub fn tokens(&self) -> &[StepToken] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<StepToken> for WaitFor {
    fn from(token: StepToken) -> Self {
        Self::step(token)
    }
}

impl From<Option<StepToken>> for WaitFor {
    fn from(token: Option<StepToken>) -> Self {
        token.map(Self::step).unwrap_or_default()
    }
}

// =============================================================================
// Steps
// =============================================================================

/// What a step does and how it is undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub label: String,
    /// Resource the step affects
    pub resource: ResourceId,
    pub forward: Invocation,
    /// `None` marks an irreversible step; `Some(Invocation::NoOp)` a step
    /// whose compensation legitimately does nothing.
    pub rollback: Option<Invocation>,
    /// Named locks held while the step runs
    pub lock_keys: Vec<String>,
}

impl StepSpec {
    pub fn new(label: impl Into<String>, resource: impl Into<ResourceId>, forward: Invocation) -> Self {
        Self {
            label: label.into(),
            resource: resource.into(),
            forward,
            rollback: None,
            lock_keys: Vec::new(),
        }
    }

    pub fn with_rollback(mut self, rollback: Invocation) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn with_no_op_rollback(self) -> Self {
        self.with_rollback(Invocation::NoOp)
    }

    pub fn with_locks(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.lock_keys.extend(keys);
        self
    }
}

/// A step placed in the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub token: StepToken,
    pub wait_for: WaitFor,
    pub spec: StepSpec,
}

// =============================================================================
// Graph
// =============================================================================

/// DAG of steps for one operation
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    nodes: IndexMap<StepToken, StepNode>,
    /// Tokens handed out by `create_step_id` and not yet filled
    reserved: IndexSet<StepToken>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate a token so later steps can reference a step whose
    /// content is not known yet
    pub fn create_step_id(&mut self) -> StepToken {
        let token = StepToken::generate();
        self.reserved.insert(token);
        token
    }

    /// Add a step with a fresh token
    pub fn create_step(&mut self, wait_for: impl Into<WaitFor>, spec: StepSpec) -> Result<StepToken> {
        let token = StepToken::generate();
        self.insert(token, wait_for.into(), spec)?;
        Ok(token)
    }

    /// Fill a token obtained from [`create_step_id`](Self::create_step_id)
    pub fn create_step_with_id(
        &mut self,
        token: StepToken,
        wait_for: impl Into<WaitFor>,
        spec: StepSpec,
    ) -> Result<StepToken> {
        if !self.reserved.contains(&token) {
            return Err(Error::InvalidStepGraph(format!(
                "step id {} was not reserved or is already used",
                token
            )));
        }
        self.insert(token, wait_for.into(), spec)?;
        self.reserved.shift_remove(&token);
        Ok(token)
    }

    fn insert(&mut self, token: StepToken, wait_for: WaitFor, spec: StepSpec) -> Result<()> {
        for dep in wait_for.tokens() {
            if *dep == token {
                return Err(Error::InvalidStepGraph(format!(
                    "step '{}' waits for itself",
                    spec.label
                )));
            }
            if !self.nodes.contains_key(dep) && !self.reserved.contains(dep) {
                return Err(Error::InvalidStepGraph(format!(
                    "step '{}' waits for unknown step {}",
                    spec.label, dep
                )));
            }
        }
        self.nodes.insert(token, StepNode { token, wait_for, spec });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, token: &StepToken) -> Option<&StepNode> {
        self.nodes.get(token)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &StepNode> {
        self.nodes.values()
    }

    /// Steps with no successors
    pub fn leaves(&self) -> Vec<StepToken> {
        let depended_on: BTreeSet<StepToken> = self
            .nodes
            .values()
            .flat_map(|n| n.wait_for.tokens().iter().copied())
            .collect();
        self.nodes
            .keys()
            .filter(|t| !depended_on.contains(t))
            .copied()
            .collect()
    }

    /// Topological order of the steps.
    ///
    /// Ties are broken by insertion order so the result is stable. Fails on
    /// unfilled reserved tokens and cycles.
    pub fn linearize(&self) -> Result<Vec<StepToken>> {
        if let Some(token) = self.reserved.first() {
            return Err(Error::InvalidStepGraph(format!(
                "reserved step id {} was never filled",
                token
            )));
        }

        let mut in_degree: HashMap<StepToken, usize> = HashMap::with_capacity(self.nodes.len());
        let mut successors: HashMap<StepToken, Vec<StepToken>> = HashMap::new();
        for node in self.nodes.values() {
            in_degree.insert(node.token, node.wait_for.tokens().len());
            for dep in node.wait_for.tokens() {
                successors.entry(*dep).or_default().push(node.token);
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut emitted: BTreeSet<StepToken> = BTreeSet::new();
        // Repeatedly take the earliest-inserted ready node
        while order.len() < self.nodes.len() {
            let next = self
                .nodes
                .keys()
                .find(|t| !emitted.contains(*t) && in_degree.get(*t) == Some(&0))
                .copied();
            let Some(token) = next else {
                return Err(Error::InvalidStepGraph("step graph contains a cycle".into()));
            };
            emitted.insert(token);
            order.push(token);
            for succ in successors.get(&token).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                }
            }
        }
        Ok(order)
    }
}
