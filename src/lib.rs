// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Idempotent maintenance of TLS keys, CSRs and self-signed certificates.
//!
//! For each certificate identity six files are kept up to date by calling
//! `openssl`: private key, request config, CSR, CSR text dump, self-signed
//! certificate and a key+certificate bundle. Keys and certificates are only
//! ever created, never replaced; a changed subject regenerates the CSR.
//!
//! ```rust,no_run
//! use certkeeper::{Config, Engine, Layer};
//!
//! let config = Config::load(&Config::locate(None)?)?;
//! let resolved = config.resolve("host.berkeley.edu", Layer::default())?;
//!
//! let engine = Engine::openssl(&config.runtime);
//! let report = engine.apply(resolved.input, &resolved.settings)?;
//! println!("{}", report);
//! # Ok::<(), certkeeper::Error>(())
//! ```

/// Layered configuration.
pub mod config;
/// Validation, planning and parallel execution entry points.
pub mod engine;
/// Error types.
pub mod error;
/// Step execution for one identity.
pub mod executor;
/// Filesystem utilities.
pub mod fs;
/// Step dependency graph.
pub mod graph;
/// Certificate subject validation.
pub mod identity;
/// Artifact paths and existence probing.
pub mod plan;
/// Request config rendering.
pub mod render;
/// Run reports.
pub mod report;
/// External crypto tool.
pub mod tool;

pub use config::{Config, Directories, Layer, Resolved, RuntimeConfig, Settings, CONFIG_ENV};
pub use engine::{Engine, Job};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{Executor, Preview};
pub use fs::Ownership;
pub use graph::{ChangeGraph, Decision, PlannedStep, SkipReason, Step, Trigger};
pub use identity::{
    canonical_name, validate, validate_hostname, CertificateIdentity, IdentityInput,
};
pub use plan::{ArtifactKind, ArtifactSet, ArtifactState, ArtifactStates};
pub use render::{ConfigRenderer, OpensslConfigRenderer};
pub use report::{ExecutionReport, Outcome, StepRecord};
pub use tool::{CryptoTool, OpensslTool};
