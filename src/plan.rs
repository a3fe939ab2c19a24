// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::config::Directories;
use crate::error::Result;
use crate::fs::read_if_exists;
use crate::identity::CertificateIdentity;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// The files maintained for every certificate identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Key,
    Config,
    Csr,
    CsrText,
    Certificate,
    Bundle,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::Key,
        ArtifactKind::Config,
        ArtifactKind::Csr,
        ArtifactKind::CsrText,
        ArtifactKind::Certificate,
        ArtifactKind::Bundle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArtifactKind::Key => "key",
            ArtifactKind::Config => "config",
            ArtifactKind::Csr => "csr",
            ArtifactKind::CsrText => "csr-text",
            ArtifactKind::Certificate => "certificate",
            ArtifactKind::Bundle => "bundle",
        }
    }

    /// Key and bundle hold private key material.
    pub fn is_secret(self) -> bool {
        matches!(self, ArtifactKind::Key | ArtifactKind::Bundle)
    }

    /// Artifacts this one is generated from and must follow.
    ///
    /// Empty for artifacts that are only ever created once.
    pub fn sources(self) -> &'static [ArtifactKind] {
        match self {
            ArtifactKind::Csr => &[ArtifactKind::Config, ArtifactKind::Key],
            ArtifactKind::CsrText => &[ArtifactKind::Csr],
            _ => &[],
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Paths of every artifact for one identity.
///
/// Derived purely from the common name and the configured directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    pub key: PathBuf,
    pub config: PathBuf,
    pub csr: PathBuf,
    pub csr_text: PathBuf,
    pub certificate: PathBuf,
    pub bundle: PathBuf,
    /// Digest of the config and key the CSR was generated from
    pub csr_digest: PathBuf,
    /// Digest of the CSR the text dump was generated from
    pub csr_text_digest: PathBuf,
    /// Lock file serializing runs for this identity
    pub lock: PathBuf,
}

impl ArtifactSet {
    pub fn plan(identity: &CertificateIdentity, dirs: &Directories) -> Self {
        let stem = identity.file_stem();
        let meta = dirs.meta_dir();
        Self {
            key: dirs.key_dir.join(format!("{}.key", stem)),
            config: meta.join(format!("{}.cnf", stem)),
            csr: meta.join(format!("{}.csr", stem)),
            csr_text: meta.join(format!("{}.csr.txt", stem)),
            certificate: dirs.cert_dir.join(format!("{}.crt", stem)),
            bundle: dirs.bundle_dir.join(format!("{}.pem", stem)),
            csr_digest: meta.join(format!("{}.csr.digest", stem)),
            csr_text_digest: meta.join(format!("{}.csr.txt.digest", stem)),
            lock: meta.join(format!(".{}.lock", stem)),
        }
    }

    pub fn path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Key => &self.key,
            ArtifactKind::Config => &self.config,
            ArtifactKind::Csr => &self.csr,
            ArtifactKind::CsrText => &self.csr_text,
            ArtifactKind::Certificate => &self.certificate,
            ArtifactKind::Bundle => &self.bundle,
        }
    }

    /// Where the source digest of `kind` is recorded, for derived artifacts.
    pub fn source_record(&self, kind: ArtifactKind) -> Option<&Path> {
        match kind {
            ArtifactKind::Csr => Some(&self.csr_digest),
            ArtifactKind::CsrText => Some(&self.csr_text_digest),
            _ => None,
        }
    }

    /// SHA-256 over the current contents of the sources of `kind`, hex
    /// encoded. `None` when a source does not exist.
    pub fn source_digest(&self, kind: ArtifactKind) -> Result<Option<String>> {
        let mut hasher = Sha256::new();
        for &source in kind.sources() {
            let Some(bytes) = read_if_exists(self.path(source))? else {
                return Ok(None);
            };
            hasher.update(source.name().as_bytes());
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(&bytes);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// A derived artifact is stale when its record is missing or no longer
    /// matches its sources. Unreadable inputs count as stale.
    fn is_stale(&self, kind: ArtifactKind) -> bool {
        let Some(record) = self.source_record(kind) else {
            return false;
        };
        let recorded = match read_if_exists(record) {
            Ok(Some(bytes)) => bytes,
            _ => return true,
        };
        match self.source_digest(kind) {
            Ok(Some(current)) => String::from_utf8_lossy(&recorded).trim() != current,
            _ => true,
        }
    }

    /// Check which artifacts exist, and whether derived ones still match
    /// what they were generated from.
    pub fn probe(&self) -> ArtifactStates {
        let states = ArtifactKind::ALL
            .iter()
            .map(|&kind| {
                let state = if !self.path(kind).is_file() {
                    ArtifactState::Absent
                } else if self.is_stale(kind) {
                    ArtifactState::Stale
                } else {
                    ArtifactState::Present
                };
                (kind, state)
            })
            .collect();
        ArtifactStates { states }
    }

    /// Every directory an artifact lives in, deduplicated.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = ArtifactKind::ALL
            .iter()
            .filter_map(|&kind| self.path(kind).parent().map(Path::to_path_buf))
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Absent,
    Present,
    /// Exists, but was generated from inputs that have since changed.
    Stale,
}

/// Existence of each artifact at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactStates {
    states: BTreeMap<ArtifactKind, ArtifactState>,
}

impl ArtifactStates {
    /// Build states by hand, mostly for previews and tests.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ArtifactKind, ArtifactState)>) -> Self {
        let mut states: BTreeMap<_, _> = ArtifactKind::ALL
            .iter()
            .map(|&kind| (kind, ArtifactState::Absent))
            .collect();
        states.extend(pairs);
        Self { states }
    }

    pub fn get(&self, kind: ArtifactKind) -> ArtifactState {
        self.states
            .get(&kind)
            .copied()
            .unwrap_or(ArtifactState::Absent)
    }

    /// Exists on disk, stale or not.
    pub fn is_present(&self, kind: ArtifactKind) -> bool {
        self.get(kind) != ArtifactState::Absent
    }

    pub fn is_stale(&self, kind: ArtifactKind) -> bool {
        self.get(kind) == ArtifactState::Stale
    }

    pub fn all_present(&self) -> bool {
        ArtifactKind::ALL.iter().all(|&kind| self.is_present(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, ArtifactState)> + '_ {
        self.states.iter().map(|(k, s)| (*k, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{validate, IdentityInput};
    use std::fs;
    use tempfile::TempDir;

    fn identity(cn: &str) -> CertificateIdentity {
        validate(IdentityInput {
            common_name: cn.into(),
            alt_names: vec![],
            country: "US".into(),
            state: "CA".into(),
            city: "Berkeley".into(),
            org: "UCB".into(),
            org_unit: "IT".into(),
        })
        .expect("identity should validate")
    }

    #[test]
    fn test_plan_layout() {
        let dirs = Directories::new("/k", "/c", "/b");
        let set = ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs);
        assert_eq!(set.key, PathBuf::from("/k/host.berkeley.edu.key"));
        assert_eq!(set.config, PathBuf::from("/c/meta/host.berkeley.edu.cnf"));
        assert_eq!(set.csr, PathBuf::from("/c/meta/host.berkeley.edu.csr"));
        assert_eq!(
            set.csr_text,
            PathBuf::from("/c/meta/host.berkeley.edu.csr.txt")
        );
        assert_eq!(set.certificate, PathBuf::from("/c/host.berkeley.edu.crt"));
        assert_eq!(set.bundle, PathBuf::from("/b/host.berkeley.edu.pem"));
        assert_eq!(set.lock, PathBuf::from("/c/meta/.host.berkeley.edu.lock"));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let dirs = Directories::default();
        let id = identity("host.berkeley.edu");
        assert_eq!(ArtifactSet::plan(&id, &dirs), ArtifactSet::plan(&id, &dirs));
    }

    #[test]
    fn test_plan_trailing_dot_shares_paths() {
        let dirs = Directories::default();
        assert_eq!(
            ArtifactSet::plan(&identity("host.berkeley.edu."), &dirs),
            ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs)
        );
    }

    #[test]
    fn test_plan_ignores_common_name_case() {
        let dirs = Directories::default();
        assert_eq!(
            ArtifactSet::plan(&identity("HOST.Berkeley.EDU"), &dirs),
            ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs)
        );
    }

    #[test]
    fn test_directories_deduplicated() {
        let dirs = Directories::new("/etc/ssl/private", "/etc/ssl/certs", "/etc/ssl/private");
        let set = ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs);
        assert_eq!(
            set.directories(),
            vec![
                PathBuf::from("/etc/ssl/certs"),
                PathBuf::from("/etc/ssl/certs/meta"),
                PathBuf::from("/etc/ssl/private"),
            ]
        );
    }

    #[test]
    fn test_regular_files_count_as_present() {
        let temp = TempDir::new().expect("temp dir should be created");
        let dirs = Directories::under(temp.path());
        let set = ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs);

        let states = set.probe();
        assert!(ArtifactKind::ALL
            .iter()
            .all(|&k| states.get(k) == ArtifactState::Absent));

        fs::create_dir_all(&dirs.key_dir).expect("dir should be created");
        fs::write(&set.key, b"not really a key").expect("write should succeed");
        // A directory in place of the certificate does not count.
        fs::create_dir_all(&set.certificate).expect("dir should be created");

        let states = set.probe();
        assert!(states.is_present(ArtifactKind::Key));
        assert!(!states.is_present(ArtifactKind::Certificate));
        assert!(!states.all_present());
    }

    #[test]
    fn test_csr_stale_until_recorded() {
        let temp = TempDir::new().expect("temp dir should be created");
        let dirs = Directories::under(temp.path());
        let set = ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs);
        fs::create_dir_all(&dirs.key_dir).expect("dir should be created");
        fs::create_dir_all(dirs.meta_dir()).expect("dir should be created");
        fs::write(&set.key, b"key").expect("write should succeed");
        fs::write(&set.config, b"config one").expect("write should succeed");
        fs::write(&set.csr, b"csr").expect("write should succeed");

        // No record yet.
        assert!(set.probe().is_stale(ArtifactKind::Csr));

        let digest = set
            .source_digest(ArtifactKind::Csr)
            .expect("sources should be readable")
            .expect("sources should exist");
        fs::write(&set.csr_digest, format!("{}\n", digest)).expect("write should succeed");
        let states = set.probe();
        assert_eq!(states.get(ArtifactKind::Csr), ArtifactState::Present);
        // Nothing recorded for the text dump.
        assert_eq!(states.get(ArtifactKind::CsrText), ArtifactState::Absent);

        fs::write(&set.config, b"config two").expect("write should succeed");
        let states = set.probe();
        assert!(states.is_stale(ArtifactKind::Csr));
        assert!(states.is_present(ArtifactKind::Csr));
    }

    #[test]
    fn test_source_digest_needs_every_source() {
        let temp = TempDir::new().expect("temp dir should be created");
        let dirs = Directories::under(temp.path());
        let set = ArtifactSet::plan(&identity("host.berkeley.edu"), &dirs);
        fs::create_dir_all(dirs.meta_dir()).expect("dir should be created");
        fs::write(&set.config, b"config").expect("write should succeed");

        assert_eq!(
            set.source_digest(ArtifactKind::Csr)
                .expect("read should succeed"),
            None
        );
        assert!(ArtifactKind::Key.sources().is_empty());
        assert!(set.source_record(ArtifactKind::Certificate).is_none());
    }

    #[test]
    fn test_states_from_pairs_default_absent() {
        let states = ArtifactStates::from_pairs([(ArtifactKind::Key, ArtifactState::Present)]);
        assert!(states.is_present(ArtifactKind::Key));
        assert_eq!(states.get(ArtifactKind::Bundle), ArtifactState::Absent);
        assert_eq!(states.iter().count(), 6);
    }
}
