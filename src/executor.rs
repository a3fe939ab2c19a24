// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::config::Settings;
use crate::error::{Error, ErrorCategory, Result};
use crate::fs::{
    atomic_write, atomic_write_secret, discard, enforce_mode_and_owner, ensure_dir, persist,
    read_if_exists, temp_sibling, write_secret_file, IdentityLock, PRIVATE_DIR_MODE, SECRET_MODE,
};
use crate::graph::{ChangeGraph, Decision, PlannedStep, SkipReason, Step};
use crate::identity::CertificateIdentity;
use crate::plan::{ArtifactKind, ArtifactSet, ArtifactStates};
use crate::render::ConfigRenderer;
use crate::report::{ExecutionReport, Outcome, StepRecord};
use crate::tool::CryptoTool;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

/// Default wait for a concurrent run on the same identity.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a run would do, computed without writing anything.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub common_name: String,
    pub artifacts: ArtifactSet,
    pub before: ArtifactStates,
    /// Rendering the config would produce different bytes than are on disk.
    pub config_changes: bool,
    pub steps: Vec<PlannedStep>,
}

impl Preview {
    pub fn would_run(&self, step: Step) -> bool {
        self.steps
            .iter()
            .any(|p| p.step == step && p.decision == Decision::Run)
    }
}

/// Runs the change graph for one identity at a time.
pub struct Executor<T, R> {
    tool: T,
    renderer: R,
    graph: ChangeGraph,
    lock_timeout: Duration,
}

struct RunContext<'a> {
    identity: &'a CertificateIdentity,
    artifacts: &'a ArtifactSet,
    settings: &'a Settings,
    before: &'a ArtifactStates,
    config_digest: Option<String>,
}

impl<T: CryptoTool, R: ConfigRenderer> Executor<T, R> {
    pub fn new(tool: T, renderer: R) -> Self {
        Self {
            tool,
            renderer,
            graph: ChangeGraph::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Bring the artifacts of `identity` up to date.
    ///
    /// Returns `Err` only when the run could not start (directories, lock,
    /// graph). Step failures are recorded in the report: dependents of a
    /// failed step are skipped, and a filesystem failure skips everything
    /// after it.
    pub fn execute(
        &self,
        identity: &CertificateIdentity,
        artifacts: &ArtifactSet,
        settings: &Settings,
    ) -> Result<ExecutionReport> {
        let span = tracing::info_span!("execute", cn = %identity.common_name());
        let _enter = span.enter();

        let order = self.graph.order()?;
        prepare_directories(artifacts)?;
        let _lock = IdentityLock::acquire(&artifacts.lock, self.lock_timeout)?;

        let before = artifacts.probe();
        let mut ctx = RunContext {
            identity,
            artifacts,
            settings,
            before: &before,
            config_digest: None,
        };

        let mut changed = BTreeSet::new();
        let mut blocked = BTreeSet::new();
        let mut aborted = false;
        let mut steps = Vec::with_capacity(order.len());

        for step in order {
            let started = Instant::now();

            let outcome = if aborted {
                Outcome::Skipped {
                    reason: SkipReason::RunAborted,
                }
            } else if blocked.contains(&step) {
                tracing::warn!(%step, "skipped because a dependency failed");
                Outcome::Skipped {
                    reason: SkipReason::DependencyFailed,
                }
            } else {
                match self.graph.decide(step, &before, &changed) {
                    Decision::Skip(reason) => {
                        tracing::debug!(%step, %reason, "skipped");
                        Outcome::Skipped { reason }
                    }
                    Decision::Run => match self.run_step(step, &mut ctx) {
                        Ok(true) => {
                            tracing::info!(%step, "changed");
                            changed.insert(step);
                            Outcome::Changed
                        }
                        Ok(false) if is_enforcement(step) => Outcome::Skipped {
                            reason: SkipReason::AlreadySatisfied,
                        },
                        Ok(false) => {
                            tracing::debug!(%step, "unchanged");
                            Outcome::Unchanged
                        }
                        Err(e) => {
                            tracing::error!(%step, error = %e, "step failed");
                            blocked.extend(self.graph.dependents_of(step));
                            if e.category() == ErrorCategory::Filesystem {
                                aborted = true;
                            }
                            Outcome::Failed {
                                category: e.category(),
                                message: e.to_string(),
                            }
                        }
                    },
                }
            };

            steps.push(StepRecord {
                step,
                outcome,
                elapsed: started.elapsed(),
            });
        }

        Ok(ExecutionReport {
            common_name: identity.common_name().to_string(),
            artifacts: artifacts.clone(),
            before: before.clone(),
            after: artifacts.probe(),
            steps,
            config_digest: ctx.config_digest,
            aborted,
        })
    }

    /// Predict what [`execute`](Self::execute) would do. Reads, never writes.
    pub fn preview(
        &self,
        identity: &CertificateIdentity,
        artifacts: &ArtifactSet,
    ) -> Result<Preview> {
        let before = artifacts.probe();
        let rendered = self.renderer.render(identity);
        let config_changes =
            read_if_exists(&artifacts.config)?.as_deref() != Some(rendered.as_bytes());
        let steps = self.graph.preview(&before, config_changes)?;

        Ok(Preview {
            common_name: identity.common_name().to_string(),
            artifacts: artifacts.clone(),
            before,
            config_changes,
            steps,
        })
    }

    /// Run one step. `Ok(true)` means the artifact was modified.
    fn run_step(&self, step: Step, ctx: &mut RunContext<'_>) -> Result<bool> {
        let artifacts = ctx.artifacts;
        match step {
            Step::GenerateKey => {
                if ctx.before.is_present(ArtifactKind::Certificate) {
                    tracing::warn!(
                        certificate = %artifacts.certificate.display(),
                        "generating a new key while a certificate exists; the certificate will not match"
                    );
                }
                stage_secret(&artifacts.key, |tmp| {
                    self.tool.generate_key(tmp, ctx.settings.key_bits)
                })?;
                Ok(true)
            }
            Step::SetKeyPermissions => {
                enforce_mode_and_owner(&artifacts.key, SECRET_MODE, &ctx.settings.ownership)
            }
            Step::RenderConfig => {
                let rendered = self.renderer.render(ctx.identity);
                ctx.config_digest = Some(hex::encode(Sha256::digest(rendered.as_bytes())));

                let current = read_if_exists(&artifacts.config)?;
                if current.as_deref() == Some(rendered.as_bytes()) {
                    return Ok(false);
                }
                atomic_write(&artifacts.config, rendered.as_bytes())?;
                Ok(true)
            }
            Step::GenerateCsr => {
                stage(&artifacts.csr, step, |tmp| {
                    self.tool
                        .generate_csr(&artifacts.config, &artifacts.key, tmp)
                })?;
                record_sources(artifacts, ArtifactKind::Csr)?;
                Ok(true)
            }
            Step::GenerateCsrText => {
                stage(&artifacts.csr_text, step, |tmp| {
                    self.tool.csr_text(&artifacts.csr, tmp)
                })?;
                record_sources(artifacts, ArtifactKind::CsrText)?;
                Ok(true)
            }
            Step::GenerateSelfSignedCert => {
                stage(&artifacts.certificate, step, |tmp| {
                    self.tool.self_sign(
                        &artifacts.config,
                        &artifacts.key,
                        tmp,
                        ctx.settings.days,
                    )
                })?;
                Ok(true)
            }
            Step::CombineBundle => {
                combine_bundle(artifacts)?;
                Ok(true)
            }
            Step::SetBundlePermissions => {
                enforce_mode_and_owner(&artifacts.bundle, SECRET_MODE, &ctx.settings.ownership)
            }
        }
    }
}

fn is_enforcement(step: Step) -> bool {
    matches!(step, Step::SetKeyPermissions | Step::SetBundlePermissions)
}

/// Directories of secret artifacts start out owner-only.
fn prepare_directories(artifacts: &ArtifactSet) -> Result<()> {
    let private: Vec<&Path> = ArtifactKind::ALL
        .into_iter()
        .filter(|kind| kind.is_secret())
        .filter_map(|kind| artifacts.path(kind).parent())
        .collect();

    for dir in artifacts.directories() {
        let mode = private
            .contains(&dir.as_path())
            .then_some(PRIVATE_DIR_MODE);
        ensure_dir(&dir, mode)?;
    }
    Ok(())
}

/// Let `produce` write a staging file, then rename it over `path`.
fn stage(path: &Path, step: Step, produce: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let tmp = temp_sibling(path)?;
    if let Err(e) = produce(&tmp) {
        discard(&tmp);
        return Err(e);
    }
    if !tmp.is_file() {
        return Err(Error::Command {
            command: step.to_string(),
            status: "success".to_string(),
            stderr: format!("no output written to {}", tmp.display()),
        });
    }
    persist(&tmp, path)
}

/// Like [`stage`], but the staging file exists with owner-only permissions
/// before the tool opens it.
fn stage_secret(path: &Path, produce: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let tmp = temp_sibling(path)?;
    write_secret_file(&tmp, b"")?;
    let result = produce(&tmp).and_then(|()| {
        let written = std::fs::metadata(&tmp).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(Error::Command {
                command: Step::GenerateKey.to_string(),
                status: "success".to_string(),
                stderr: "key file is empty".to_string(),
            });
        }
        Ok(())
    });
    if let Err(e) = result {
        discard(&tmp);
        return Err(e);
    }
    persist(&tmp, path)
}

/// Note the sources `kind` was just generated from. Written only after the
/// artifact itself is in place, so a failure in between leaves it stale.
fn record_sources(artifacts: &ArtifactSet, kind: ArtifactKind) -> Result<()> {
    let Some(record) = artifacts.source_record(kind) else {
        return Ok(());
    };
    match artifacts.source_digest(kind)? {
        Some(digest) => atomic_write(record, format!("{}\n", digest).as_bytes()),
        None => Err(Error::Precondition {
            step: kind.to_string(),
            reason: format!("sources of {} disappeared during the run", kind),
        }),
    }
}

/// Concatenate key and certificate into the bundle.
fn combine_bundle(artifacts: &ArtifactSet) -> Result<()> {
    for (kind, path) in [
        (ArtifactKind::Key, &artifacts.key),
        (ArtifactKind::Certificate, &artifacts.certificate),
    ] {
        if !path.is_file() {
            return Err(Error::Precondition {
                step: Step::CombineBundle.to_string(),
                reason: format!("{} {} does not exist", kind, path.display()),
            });
        }
    }

    let mut bundle = read_file(&artifacts.key)?;
    if !bundle.ends_with(b"\n") {
        bundle.push(b'\n');
    }
    bundle.extend(read_file(&artifacts.certificate)?);

    atomic_write_secret(&artifacts.bundle, &bundle)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}
