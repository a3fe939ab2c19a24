// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::config::{RuntimeConfig, Settings};
use crate::error::Result;
use crate::executor::{Executor, Preview};
use crate::identity::{validate, IdentityInput};
use crate::plan::ArtifactSet;
use crate::render::{ConfigRenderer, OpensslConfigRenderer};
use crate::report::ExecutionReport;
use crate::tool::{CryptoTool, OpensslTool};

/// Validation, planning and execution for any number of identities.
pub struct Engine<T, R> {
    executor: Executor<T, R>,
}

/// One identity to process and the settings resolved for it.
#[derive(Debug, Clone)]
pub struct Job {
    pub input: IdentityInput,
    pub settings: Settings,
}

impl Engine<OpensslTool, OpensslConfigRenderer> {
    /// Engine driving the `openssl` command line.
    pub fn openssl(runtime: &RuntimeConfig) -> Self {
        let tool = OpensslTool::new(runtime.openssl.clone(), runtime.command_timeout());
        Self::new(tool, OpensslConfigRenderer).with_lock_timeout(runtime.lock_timeout())
    }
}

impl<T: CryptoTool, R: ConfigRenderer> Engine<T, R> {
    pub fn new(tool: T, renderer: R) -> Self {
        Self {
            executor: Executor::new(tool, renderer),
        }
    }

    pub fn with_lock_timeout(self, timeout: std::time::Duration) -> Self {
        Self {
            executor: self.executor.with_lock_timeout(timeout),
        }
    }

    pub fn executor(&self) -> &Executor<T, R> {
        &self.executor
    }

    /// Validate the input and derive artifact paths without touching disk.
    pub fn plan(&self, input: IdentityInput, settings: &Settings) -> Result<ArtifactSet> {
        let identity = validate(input)?;
        Ok(ArtifactSet::plan(&identity, &settings.directories))
    }

    /// Validate, then bring the identity's artifacts up to date.
    ///
    /// Validation errors are returned before the tool or filesystem is touched.
    pub fn apply(&self, input: IdentityInput, settings: &Settings) -> Result<ExecutionReport> {
        let identity = validate(input)?;
        self.executor.tool().ensure_available()?;
        let artifacts = ArtifactSet::plan(&identity, &settings.directories);
        self.executor.execute(&identity, &artifacts, settings)
    }

    /// Validate, then report what [`apply`](Self::apply) would do.
    pub fn preview(&self, input: IdentityInput, settings: &Settings) -> Result<Preview> {
        let identity = validate(input)?;
        let artifacts = ArtifactSet::plan(&identity, &settings.directories);
        self.executor.preview(&identity, &artifacts)
    }

    /// Apply several identities in parallel, one thread each.
    ///
    /// Results come back in input order. A failure for one identity does not
    /// affect the others; runs on the same common name serialize on its lock.
    pub fn apply_many(&self, jobs: Vec<Job>) -> Vec<(String, Result<ExecutionReport>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| {
                    let name = job.input.common_name.clone();
                    let handle = scope.spawn(move || self.apply(job.input, &job.settings));
                    (name, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(crate::error::Error::Config(format!(
                            "worker for {} panicked",
                            name
                        )))
                    });
                    (name, result)
                })
                .collect()
        })
    }
}
