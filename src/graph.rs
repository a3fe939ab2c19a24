// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::plan::{ArtifactKind, ArtifactStates};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One operation of a run. Declaration order breaks ties in the topological sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    GenerateKey,
    SetKeyPermissions,
    RenderConfig,
    GenerateCsr,
    GenerateCsrText,
    GenerateSelfSignedCert,
    CombineBundle,
    SetBundlePermissions,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::GenerateKey,
        Step::SetKeyPermissions,
        Step::RenderConfig,
        Step::GenerateCsr,
        Step::GenerateCsrText,
        Step::GenerateSelfSignedCert,
        Step::CombineBundle,
        Step::SetBundlePermissions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::GenerateKey => "generate-key",
            Step::SetKeyPermissions => "key-permissions",
            Step::RenderConfig => "render-config",
            Step::GenerateCsr => "generate-csr",
            Step::GenerateCsrText => "generate-csr-text",
            Step::GenerateSelfSignedCert => "self-sign",
            Step::CombineBundle => "combine-bundle",
            Step::SetBundlePermissions => "bundle-permissions",
        }
    }

    /// The artifact this step creates or adjusts.
    pub fn target(self) -> ArtifactKind {
        match self {
            Step::GenerateKey | Step::SetKeyPermissions => ArtifactKind::Key,
            Step::RenderConfig => ArtifactKind::Config,
            Step::GenerateCsr => ArtifactKind::Csr,
            Step::GenerateCsrText => ArtifactKind::CsrText,
            Step::GenerateSelfSignedCert => ArtifactKind::Certificate,
            Step::CombineBundle | Step::SetBundlePermissions => ArtifactKind::Bundle,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a step should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every run. The step itself reports whether anything changed.
    Always,
    /// Only while the artifact does not exist. Never regenerates.
    IfAbsent(ArtifactKind),
    /// While the artifact does not exist or is stale, or when any listed
    /// step changed something earlier in the same run.
    IfAbsentOrChanged(ArtifactKind, &'static [Step]),
    /// Every run, to enforce mode and ownership; no-op when already correct.
    Enforce(ArtifactKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub step: Step,
    pub trigger: Trigger,
    /// Steps that must complete before this one.
    pub requires: Vec<Step>,
}

impl Node {
    pub fn new(step: Step, trigger: Trigger, requires: &[Step]) -> Self {
        Self {
            step,
            trigger,
            requires: requires.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The artifact exists and is never regenerated by this step.
    AlreadyPresent,
    /// Nothing upstream changed and the artifact exists.
    NotTriggered,
    /// Mode and ownership already correct.
    AlreadySatisfied,
    /// A step this one depends on failed.
    DependencyFailed,
    /// A filesystem failure stopped the run.
    RunAborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::AlreadyPresent => "already present",
            SkipReason::NotTriggered => "not triggered",
            SkipReason::AlreadySatisfied => "already satisfied",
            SkipReason::DependencyFailed => "dependency failed",
            SkipReason::RunAborted => "run aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "reason")]
pub enum Decision {
    Run,
    Skip(SkipReason),
}

/// A step paired with what a run would do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub step: Step,
    pub decision: Decision,
}

/// Dependency graph of the steps maintaining one identity's artifacts.
#[derive(Debug, Clone)]
pub struct ChangeGraph {
    nodes: BTreeMap<Step, Node>,
}

impl Default for ChangeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeGraph {
    /// The standard graph.
    ///
    /// Key and self-signed certificate are only ever created, never replaced.
    /// A changed config regenerates the CSR and its text dump but leaves the
    /// certificate and bundle alone.
    pub fn new() -> Self {
        use Step::*;

        let nodes = [
            Node::new(GenerateKey, Trigger::IfAbsent(ArtifactKind::Key), &[]),
            Node::new(
                SetKeyPermissions,
                Trigger::Enforce(ArtifactKind::Key),
                &[GenerateKey],
            ),
            Node::new(RenderConfig, Trigger::Always, &[]),
            Node::new(
                GenerateCsr,
                Trigger::IfAbsentOrChanged(ArtifactKind::Csr, &[RenderConfig, GenerateKey]),
                &[GenerateKey, RenderConfig],
            ),
            Node::new(
                GenerateCsrText,
                Trigger::IfAbsentOrChanged(ArtifactKind::CsrText, &[GenerateCsr]),
                &[GenerateCsr],
            ),
            Node::new(
                GenerateSelfSignedCert,
                Trigger::IfAbsent(ArtifactKind::Certificate),
                &[GenerateKey, RenderConfig],
            ),
            Node::new(
                CombineBundle,
                Trigger::IfAbsent(ArtifactKind::Bundle),
                &[GenerateKey, GenerateSelfSignedCert],
            ),
            Node::new(
                SetBundlePermissions,
                Trigger::Enforce(ArtifactKind::Bundle),
                &[CombineBundle],
            ),
        ];

        Self {
            nodes: nodes.into_iter().map(|n| (n.step, n)).collect(),
        }
    }

    /// Build a graph from arbitrary nodes, rejecting cycles and unknown
    /// dependencies.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let graph = Self {
            nodes: nodes.into_iter().map(|n| (n.step, n)).collect(),
        };
        for node in graph.nodes.values() {
            if let Some(missing) = node.requires.iter().find(|r| !graph.nodes.contains_key(*r)) {
                return Err(Error::Config(format!(
                    "step {} requires {} which is not in the graph",
                    node.step, missing
                )));
            }
        }
        graph.order()?;
        Ok(graph)
    }

    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node(&self, step: Step) -> Option<&Node> {
        self.nodes.get(&step)
    }

    pub fn requires(&self, step: Step) -> &[Step] {
        self.nodes
            .get(&step)
            .map(|n| n.requires.as_slice())
            .unwrap_or(&[])
    }

    /// Topological order (Kahn's algorithm). Among ready steps the one
    /// declared first goes first, so the order is stable.
    pub fn order(&self) -> Result<Vec<Step>> {
        let mut in_degree: BTreeMap<Step, usize> = self
            .nodes
            .values()
            .map(|n| (n.step, n.requires.len()))
            .collect();

        let mut ready: BTreeSet<Step> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(step) = ready.pop_first() {
            order.push(step);
            for node in self.nodes.values() {
                if node.requires.contains(&step) {
                    if let Some(d) = in_degree.get_mut(&node.step) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(node.step);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(s, _)| s.to_string())
                .unwrap_or_default();
            return Err(Error::CyclicGraph(stuck));
        }

        Ok(order)
    }

    /// Every step that directly or transitively requires `step`.
    pub fn dependents_of(&self, step: Step) -> BTreeSet<Step> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![step];
        while let Some(current) = frontier.pop() {
            for node in self.nodes.values() {
                if node.requires.contains(&current) && found.insert(node.step) {
                    frontier.push(node.step);
                }
            }
        }
        found
    }

    /// Decide whether `step` runs, given the probe taken at the start of the
    /// run and the steps that have changed something so far.
    pub fn decide(&self, step: Step, states: &ArtifactStates, changed: &BTreeSet<Step>) -> Decision {
        let Some(node) = self.nodes.get(&step) else {
            return Decision::Skip(SkipReason::NotTriggered);
        };

        match node.trigger {
            Trigger::Always | Trigger::Enforce(_) => Decision::Run,
            Trigger::IfAbsent(kind) => {
                if states.is_present(kind) {
                    Decision::Skip(SkipReason::AlreadyPresent)
                } else {
                    Decision::Run
                }
            }
            Trigger::IfAbsentOrChanged(kind, notifiers) => {
                if !states.is_present(kind)
                    || states.is_stale(kind)
                    || notifiers.iter().any(|n| changed.contains(n))
                {
                    Decision::Run
                } else {
                    Decision::Skip(SkipReason::NotTriggered)
                }
            }
        }
    }

    /// Predict a run without touching anything.
    ///
    /// `config_changes` says whether rendering the config would produce new
    /// content. Steps predicted to run are assumed to change their artifact.
    pub fn preview(&self, states: &ArtifactStates, config_changes: bool) -> Result<Vec<PlannedStep>> {
        let mut changed = BTreeSet::new();
        let mut planned = Vec::with_capacity(self.nodes.len());

        for step in self.order()? {
            let decision = self.decide(step, states, &changed);
            let changes = match (step, decision) {
                (Step::RenderConfig, Decision::Run) => config_changes,
                (_, Decision::Run) => !matches!(
                    self.node(step).map(|n| n.trigger),
                    Some(Trigger::Enforce(_))
                ),
                (_, Decision::Skip(_)) => false,
            };
            if changes {
                changed.insert(step);
            }
            planned.push(PlannedStep { step, decision });
        }

        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ArtifactState;

    fn present(kinds: &[ArtifactKind]) -> ArtifactStates {
        ArtifactStates::from_pairs(kinds.iter().map(|&k| (k, ArtifactState::Present)))
    }

    fn runs(planned: &[PlannedStep]) -> Vec<Step> {
        planned
            .iter()
            .filter(|p| p.decision == Decision::Run)
            .map(|p| p.step)
            .collect()
    }

    #[test]
    fn test_order_matches_expected_sequence() {
        let order = ChangeGraph::new().order().expect("graph is acyclic");
        assert_eq!(
            order,
            vec![
                Step::GenerateKey,
                Step::SetKeyPermissions,
                Step::RenderConfig,
                Step::GenerateCsr,
                Step::GenerateCsrText,
                Step::GenerateSelfSignedCert,
                Step::CombineBundle,
                Step::SetBundlePermissions,
            ]
        );
    }

    #[test]
    fn test_key_precedes_every_reader() {
        let graph = ChangeGraph::new();
        let order = graph.order().expect("graph is acyclic");
        let pos = |s: Step| order.iter().position(|x| *x == s).expect("step in order");
        for reader in [
            Step::SetKeyPermissions,
            Step::GenerateCsr,
            Step::GenerateSelfSignedCert,
            Step::CombineBundle,
        ] {
            assert!(pos(Step::GenerateKey) < pos(reader), "{} before key", reader);
        }
        for step in graph.steps() {
            for req in graph.requires(step) {
                assert!(pos(*req) < pos(step));
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            Node::new(Step::GenerateKey, Trigger::Always, &[Step::RenderConfig]),
            Node::new(Step::RenderConfig, Trigger::Always, &[Step::GenerateKey]),
        ];
        assert!(matches!(
            ChangeGraph::from_nodes(nodes),
            Err(Error::CyclicGraph(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let nodes = vec![Node::new(
            Step::GenerateCsr,
            Trigger::Always,
            &[Step::GenerateKey],
        )];
        assert!(matches!(
            ChangeGraph::from_nodes(nodes),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_dependents_of_key() {
        let deps = ChangeGraph::new().dependents_of(Step::GenerateKey);
        let expected: BTreeSet<Step> = [
            Step::SetKeyPermissions,
            Step::GenerateCsr,
            Step::GenerateCsrText,
            Step::GenerateSelfSignedCert,
            Step::CombineBundle,
            Step::SetBundlePermissions,
        ]
        .into_iter()
        .collect();
        assert_eq!(deps, expected);
    }

    #[test]
    fn test_dependents_of_csr() {
        let deps = ChangeGraph::new().dependents_of(Step::GenerateCsr);
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec![Step::GenerateCsrText]);
    }

    #[test]
    fn test_preview_empty_directory_runs_everything() {
        let planned = ChangeGraph::new()
            .preview(&present(&[]), true)
            .expect("preview should succeed");
        assert_eq!(runs(&planned), Step::ALL.to_vec());
    }

    #[test]
    fn test_preview_steady_state() {
        let planned = ChangeGraph::new()
            .preview(&present(&ArtifactKind::ALL), false)
            .expect("preview should succeed");
        assert_eq!(
            runs(&planned),
            vec![
                Step::SetKeyPermissions,
                Step::RenderConfig,
                Step::SetBundlePermissions
            ]
        );
        let decision = |s: Step| {
            planned
                .iter()
                .find(|p| p.step == s)
                .map(|p| p.decision)
                .expect("step planned")
        };
        assert_eq!(
            decision(Step::GenerateKey),
            Decision::Skip(SkipReason::AlreadyPresent)
        );
        assert_eq!(
            decision(Step::GenerateCsr),
            Decision::Skip(SkipReason::NotTriggered)
        );
    }

    #[test]
    fn test_preview_config_change_regenerates_csr_only() {
        let planned = ChangeGraph::new()
            .preview(&present(&ArtifactKind::ALL), true)
            .expect("preview should succeed");
        let ran = runs(&planned);
        assert!(ran.contains(&Step::GenerateCsr));
        assert!(ran.contains(&Step::GenerateCsrText));
        assert!(!ran.contains(&Step::GenerateKey));
        assert!(!ran.contains(&Step::GenerateSelfSignedCert));
        assert!(!ran.contains(&Step::CombineBundle));
    }

    #[test]
    fn test_missing_key_regenerates_csr_but_not_certificate() {
        let states = present(&[
            ArtifactKind::Config,
            ArtifactKind::Csr,
            ArtifactKind::CsrText,
            ArtifactKind::Certificate,
            ArtifactKind::Bundle,
        ]);
        let ran = runs(
            &ChangeGraph::new()
                .preview(&states, false)
                .expect("preview should succeed"),
        );
        assert!(ran.contains(&Step::GenerateKey));
        assert!(ran.contains(&Step::GenerateCsr));
        assert!(!ran.contains(&Step::GenerateSelfSignedCert));
        assert!(!ran.contains(&Step::CombineBundle));
    }

    #[test]
    fn test_stale_csr_regenerated_without_config_change() {
        let mut pairs: Vec<_> = ArtifactKind::ALL
            .iter()
            .map(|&k| (k, ArtifactState::Present))
            .collect();
        pairs.push((ArtifactKind::Csr, ArtifactState::Stale));
        let states = ArtifactStates::from_pairs(pairs);

        let graph = ChangeGraph::new();
        assert_eq!(
            graph.decide(Step::GenerateCsr, &states, &BTreeSet::new()),
            Decision::Run
        );
        let ran = runs(&graph.preview(&states, false).expect("preview should succeed"));
        assert!(ran.contains(&Step::GenerateCsr));
        assert!(ran.contains(&Step::GenerateCsrText));
        assert!(!ran.contains(&Step::GenerateKey));
        assert!(!ran.contains(&Step::GenerateSelfSignedCert));
    }

    #[test]
    fn test_missing_csr_text_alone() {
        let states = present(&[
            ArtifactKind::Key,
            ArtifactKind::Config,
            ArtifactKind::Csr,
            ArtifactKind::Certificate,
            ArtifactKind::Bundle,
        ]);
        let ran = runs(
            &ChangeGraph::new()
                .preview(&states, false)
                .expect("preview should succeed"),
        );
        assert!(ran.contains(&Step::GenerateCsrText));
        assert!(!ran.contains(&Step::GenerateCsr));
    }
}
