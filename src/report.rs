// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::ErrorCategory;
use crate::graph::{SkipReason, Step};
use crate::plan::{ArtifactSet, ArtifactStates};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// What happened to a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    /// The step ran and modified its artifact.
    Changed,
    /// The step ran and found nothing to change.
    Unchanged,
    Skipped { reason: SkipReason },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Changed => f.write_str("changed"),
            Outcome::Unchanged => f.write_str("unchanged"),
            Outcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            Outcome::Failed { message, .. } => write!(f, "FAILED: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: Step,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

/// Result of one run for one identity.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub common_name: String,
    pub artifacts: ArtifactSet,
    /// Existence of each artifact before the run
    pub before: ArtifactStates,
    /// Existence of each artifact after the run
    pub after: ArtifactStates,
    pub steps: Vec<StepRecord>,
    /// SHA-256 of the rendered request config, hex encoded
    pub config_digest: Option<String>,
    /// A filesystem failure stopped the run early.
    pub aborted: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        !self.aborted && !self.steps.iter().any(|r| r.outcome.is_failure())
    }

    pub fn outcome(&self, step: Step) -> Option<&Outcome> {
        self.steps
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }

    /// Whether `step` was actually attempted in this run.
    pub fn invoked(&self, step: Step) -> bool {
        matches!(
            self.outcome(step),
            Some(Outcome::Changed | Outcome::Unchanged | Outcome::Failed { .. })
        )
    }

    pub fn changed(&self) -> Vec<Step> {
        self.steps_where(|o| matches!(o, Outcome::Changed))
    }

    pub fn skipped(&self) -> Vec<Step> {
        self.steps_where(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> Vec<Step> {
        self.steps_where(Outcome::is_failure)
    }

    fn steps_where(&self, pred: impl Fn(&Outcome) -> bool) -> Vec<Step> {
        self.steps
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.step)
            .collect()
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.common_name)?;
        for record in &self.steps {
            writeln!(f, "  {:<20} {}", record.step.name(), record.outcome)?;
        }
        let status = if self.aborted {
            "aborted"
        } else if self.is_success() {
            "ok"
        } else {
            "failed"
        };
        write!(
            f,
            "  {} changed, {} skipped, {} failed ({})",
            self.changed().len(),
            self.skipped().len(),
            self.failed().len(),
            status
        )
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
