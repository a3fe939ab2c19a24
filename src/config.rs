// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::Ownership;
use crate::identity::{canonical_name, IdentityInput};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current config file version. Increment when making breaking changes.
const CONFIG_VERSION: u32 = 1;

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "CERTKEEPER_CONFIG";

pub const DEFAULT_KEY_DIR: &str = "/etc/ssl/private";
pub const DEFAULT_CERT_DIR: &str = "/etc/ssl/certs";
pub const DEFAULT_BUNDLE_DIR: &str = "/etc/ssl/private";
pub const DEFAULT_KEY_BITS: u32 = 2048;
pub const DEFAULT_DAYS: u32 = 365;
pub const DEFAULT_OWNER: &str = "root";
pub const DEFAULT_GROUP: &str = "root";

pub const MIN_KEY_BITS: u32 = 1024;
pub const MAX_KEY_BITS: u32 = 16384;
pub const MAX_DAYS: u32 = 3650;

/// One level of settings. Unset fields fall through to the next level down.
///
/// The same shape is used for the `[defaults]` table, each
/// `[certificates."<name>"]` table and command-line overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layer {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub org: Option<String>,
    pub org_unit: Option<String>,
    pub alt_names: Option<Vec<String>>,
    pub key_dir: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub bundle_dir: Option<PathBuf>,
    pub key_bits: Option<u32>,
    pub days: Option<u32>,
    /// Owner of the key and bundle. An empty string leaves ownership untouched.
    pub owner: Option<String>,
    /// Group of the key and bundle. An empty string leaves ownership untouched.
    pub group: Option<String>,
}

impl Layer {
    /// Compiled-in defaults, the lowest level.
    ///
    /// Subject fields have no built-in value and must come from configuration.
    pub fn builtin() -> Self {
        Self {
            alt_names: Some(Vec::new()),
            key_dir: Some(PathBuf::from(DEFAULT_KEY_DIR)),
            cert_dir: Some(PathBuf::from(DEFAULT_CERT_DIR)),
            bundle_dir: Some(PathBuf::from(DEFAULT_BUNDLE_DIR)),
            key_bits: Some(DEFAULT_KEY_BITS),
            days: Some(DEFAULT_DAYS),
            owner: Some(DEFAULT_OWNER.to_string()),
            group: Some(DEFAULT_GROUP.to_string()),
            ..Self::default()
        }
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn or(self, lower: Layer) -> Layer {
        Layer {
            country: self.country.or(lower.country),
            state: self.state.or(lower.state),
            city: self.city.or(lower.city),
            org: self.org.or(lower.org),
            org_unit: self.org_unit.or(lower.org_unit),
            alt_names: self.alt_names.or(lower.alt_names),
            key_dir: self.key_dir.or(lower.key_dir),
            cert_dir: self.cert_dir.or(lower.cert_dir),
            bundle_dir: self.bundle_dir.or(lower.bundle_dir),
            key_bits: self.key_bits.or(lower.key_bits),
            days: self.days.or(lower.days),
            owner: self.owner.or(lower.owner),
            group: self.group.or(lower.group),
        }
    }
}

/// Settings for running the external tool, shared by every certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Path or name of the openssl binary
    #[serde(default = "default_openssl")]
    pub openssl: String,
    /// Seconds before an external command is killed
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Seconds to wait for another run on the same certificate to finish
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            openssl: default_openssl(),
            command_timeout_secs: default_command_timeout_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

fn default_openssl() -> String {
    "openssl".to_string()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Config file version for future migration support
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Class-level defaults applied to every certificate
    #[serde(default)]
    pub defaults: Layer,
    /// Resource-level settings keyed by common name
    #[serde(default)]
    pub certificates: BTreeMap<String, Layer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            runtime: RuntimeConfig::default(),
            defaults: Layer::default(),
            certificates: BTreeMap::new(),
        }
    }
}

/// Where the artifacts of every certificate live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directories {
    pub key_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub bundle_dir: PathBuf,
}

impl Directories {
    pub fn new(
        key_dir: impl Into<PathBuf>,
        cert_dir: impl Into<PathBuf>,
        bundle_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key_dir: key_dir.into(),
            cert_dir: cert_dir.into(),
            bundle_dir: bundle_dir.into(),
        }
    }

    /// All three directories under one root, used by tests and sandboxes.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("private"), root.join("certs"), root.join("bundles"))
    }

    /// Config, CSR and CSR text live here.
    pub fn meta_dir(&self) -> PathBuf {
        self.cert_dir.join("meta")
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_DIR, DEFAULT_CERT_DIR, DEFAULT_BUNDLE_DIR)
    }
}

/// Fully resolved, non-identity settings for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub directories: Directories,
    pub key_bits: u32,
    pub days: u32,
    pub ownership: Ownership,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directories: Directories::default(),
            key_bits: DEFAULT_KEY_BITS,
            days: DEFAULT_DAYS,
            ownership: Ownership::new(
                Some(DEFAULT_OWNER.to_string()),
                Some(DEFAULT_GROUP.to_string()),
            ),
        }
    }
}

/// Everything needed to run one certificate: raw identity plus settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub input: IdentityInput,
    pub settings: Settings,
}

impl Config {
    /// Locate the config file: explicit path, then `CERTKEEPER_CONFIG`, then
    /// the per-user config directory.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        if let Ok(custom) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&custom);
            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "{} must be an absolute path, got: {}",
                    CONFIG_ENV, custom
                )));
            }
            return Ok(path);
        }

        ProjectDirs::from("", "", "certkeeper")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Could not determine config directory. Set {} or pass --config.",
                    CONFIG_ENV
                ))
            })
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            Self::parse(&content)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.config_version > CONFIG_VERSION {
            tracing::warn!(
                version = self.config_version,
                supported = CONFIG_VERSION,
                "config file is newer than this build; some settings may not be recognized"
            );
        }

        if self.runtime.openssl.trim().is_empty() {
            return Err(Error::Config("runtime.openssl cannot be empty".into()));
        }
        if self.runtime.command_timeout_secs == 0 {
            return Err(Error::Config(
                "runtime.command_timeout_secs must be at least 1".into(),
            ));
        }
        if self.runtime.lock_timeout_secs == 0 {
            return Err(Error::Config(
                "runtime.lock_timeout_secs must be at least 1".into(),
            ));
        }

        validate_layer("defaults", &self.defaults)?;
        let mut seen = BTreeMap::new();
        for (name, layer) in &self.certificates {
            validate_layer(name, layer)?;
            if let Some(other) = seen.insert(canonical_name(name), name) {
                return Err(Error::Config(format!(
                    "[certificates] lists the same host twice: \"{}\" and \"{}\"",
                    other, name
                )));
            }
        }

        Ok(())
    }

    /// Common names that have their own `[certificates]` entry, lowercased
    /// and without a trailing dot.
    pub fn certificate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .certificates
            .keys()
            .map(|n| canonical_name(n))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// The `[certificates]` table for `common_name`, ignoring case and a
    /// trailing dot on either side.
    fn certificate(&self, common_name: &str) -> Option<&Layer> {
        let wanted = canonical_name(common_name);
        self.certificates
            .iter()
            .find(|(name, _)| canonical_name(name) == wanted)
            .map(|(_, layer)| layer)
    }

    /// Resolve settings for `common_name`.
    ///
    /// Precedence, highest first: `overrides`, the certificate's own table,
    /// `[defaults]`, built-in values.
    pub fn resolve(&self, common_name: &str, overrides: Layer) -> Result<Resolved> {
        validate_layer("command line", &overrides)?;

        let resource = self.certificate(common_name).cloned().unwrap_or_default();
        let merged = overrides
            .or(resource)
            .or(self.defaults.clone())
            .or(Layer::builtin());

        let required = |value: Option<String>, field: &str| {
            value.ok_or_else(|| {
                Error::Config(format!(
                    "'{}' is not set for {} (add it to [defaults] or [certificates.\"{}\"])",
                    field, common_name, common_name
                ))
            })
        };

        let input = IdentityInput {
            common_name: common_name.to_string(),
            alt_names: merged.alt_names.unwrap_or_default(),
            country: required(merged.country, "country")?,
            state: required(merged.state, "state")?,
            city: required(merged.city, "city")?,
            org: required(merged.org, "org")?,
            org_unit: required(merged.org_unit, "org_unit")?,
        };

        let settings = Settings {
            directories: Directories::new(
                merged.key_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR)),
                merged.cert_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR)),
                merged
                    .bundle_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_BUNDLE_DIR)),
            ),
            key_bits: merged.key_bits.unwrap_or(DEFAULT_KEY_BITS),
            days: merged.days.unwrap_or(DEFAULT_DAYS),
            ownership: Ownership::new(non_empty(merged.owner), non_empty(merged.group)),
        };

        Ok(Resolved { input, settings })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn validate_layer(scope: &str, layer: &Layer) -> Result<()> {
    if let Some(bits) = layer.key_bits {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(Error::Config(format!(
                "{}: key_bits must be between {} and {}",
                scope, MIN_KEY_BITS, MAX_KEY_BITS
            )));
        }
    }

    if let Some(days) = layer.days {
        if days == 0 || days > MAX_DAYS {
            return Err(Error::Config(format!(
                "{}: days must be between 1 and {} (10 years)",
                scope, MAX_DAYS
            )));
        }
    }

    for (field, dir) in [
        ("key_dir", &layer.key_dir),
        ("cert_dir", &layer.cert_dir),
        ("bundle_dir", &layer.bundle_dir),
    ] {
        if let Some(dir) = dir {
            if !dir.is_absolute() {
                return Err(Error::Config(format!(
                    "{}: {} must be an absolute path, got: {}",
                    scope,
                    field,
                    dir.display()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
config_version = 1

[runtime]
openssl = "/usr/bin/openssl"

[defaults]
country = "US"
state = "CA"
city = "Berkeley"
org = "UCB"
org_unit = "IT"
days = 90

[certificates."host.berkeley.edu"]
alt_names = ["alt.example.edu"]
org_unit = "Research IT"
key_bits = 4096
"#;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.runtime.openssl, "openssl");
        assert_eq!(config.runtime.command_timeout_secs, 120);
        assert!(config.certificates.is_empty());
    }

    #[test]
    fn test_config_load_missing_file() {
        let path = PathBuf::from("/nonexistent/certkeeper/config.toml");
        let config =
            Config::load(&path).expect("Config should load with defaults for missing file");
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.defaults, Layer::default());
    }

    #[test]
    fn test_config_load_sample() {
        let mut file = NamedTempFile::new().expect("temp file should be created");
        write!(file, "{}", SAMPLE).expect("write should succeed");

        let config = Config::load(file.path()).expect("Config should load successfully");
        assert_eq!(config.runtime.openssl, "/usr/bin/openssl");
        assert_eq!(config.runtime.lock_timeout_secs, 30);
        assert_eq!(config.certificate_names(), vec!["host.berkeley.edu"]);
    }

    #[test]
    fn test_resolve_precedence() {
        let config = Config::parse(SAMPLE).expect("sample should parse");

        let resolved = config
            .resolve("host.berkeley.edu", Layer::default())
            .expect("resolve should succeed");
        // resource-level
        assert_eq!(resolved.input.org_unit, "Research IT");
        assert_eq!(resolved.input.alt_names, vec!["alt.example.edu"]);
        assert_eq!(resolved.settings.key_bits, 4096);
        // class-level
        assert_eq!(resolved.input.country, "US");
        assert_eq!(resolved.settings.days, 90);
        // built-in
        assert_eq!(
            resolved.settings.directories.key_dir,
            PathBuf::from(DEFAULT_KEY_DIR)
        );
        assert_eq!(
            resolved.settings.ownership,
            Ownership::new(Some("root".into()), Some("root".into()))
        );

        let overrides = Layer {
            org_unit: Some("Ops".into()),
            days: Some(30),
            ..Layer::default()
        };
        let resolved = config
            .resolve("host.berkeley.edu", overrides)
            .expect("resolve should succeed");
        assert_eq!(resolved.input.org_unit, "Ops");
        assert_eq!(resolved.settings.days, 30);
        assert_eq!(resolved.settings.key_bits, 4096);
    }

    #[test]
    fn test_resolve_unlisted_name_uses_defaults() {
        let config = Config::parse(SAMPLE).expect("sample should parse");
        let resolved = config
            .resolve("other.berkeley.edu", Layer::default())
            .expect("resolve should succeed");
        assert_eq!(resolved.input.common_name, "other.berkeley.edu");
        assert!(resolved.input.alt_names.is_empty());
        assert_eq!(resolved.input.org_unit, "IT");
        assert_eq!(resolved.settings.key_bits, DEFAULT_KEY_BITS);
    }

    #[test]
    fn test_resolve_ignores_case_and_trailing_dot() {
        let config = Config::parse(SAMPLE).expect("sample should parse");
        for spelling in ["host.berkeley.edu.", "HOST.Berkeley.edu"] {
            let resolved = config
                .resolve(spelling, Layer::default())
                .expect("resolve should succeed");
            assert_eq!(resolved.input.alt_names, vec!["alt.example.edu"]);
            assert_eq!(resolved.settings.key_bits, 4096);
        }

        let config = Config::parse(&SAMPLE.replace("host.berkeley.edu", "Host.Berkeley.EDU."))
            .expect("config should parse");
        assert_eq!(config.certificate_names(), vec!["host.berkeley.edu"]);
        let resolved = config
            .resolve("host.berkeley.edu", Layer::default())
            .expect("resolve should succeed");
        assert_eq!(resolved.settings.key_bits, 4096);
    }

    #[test]
    fn test_config_rejects_duplicate_hosts() {
        let mut file = NamedTempFile::new().expect("temp file should be created");
        write!(
            file,
            "[certificates.\"a.example\"]\n[certificates.\"A.example.\"]\n"
        )
        .expect("write should succeed");
        let err = Config::load(file.path()).expect_err("duplicate hosts should be rejected");
        assert!(err.to_string().contains("same host"));
    }

    #[test]
    fn test_resolve_missing_subject_field() {
        let config = Config::default();
        let err = config
            .resolve("host.berkeley.edu", Layer::default())
            .expect_err("country is not set anywhere");
        assert!(err.to_string().contains("country"));
    }

    #[test]
    fn test_resolve_empty_owner_disables_chown() {
        let config = Config::parse(SAMPLE).expect("sample should parse");
        let overrides = Layer {
            owner: Some(String::new()),
            group: Some(String::new()),
            ..Layer::default()
        };
        let resolved = config
            .resolve("host.berkeley.edu", overrides)
            .expect("resolve should succeed");
        assert_eq!(resolved.settings.ownership, Ownership::unchanged());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        for bad in [
            "[defaults]\nkey_bits = 512\n",
            "[defaults]\ndays = 0\n",
            "[defaults]\ndays = 99999\n",
            "[defaults]\nkey_dir = \"relative/dir\"\n",
            "[runtime]\ncommand_timeout_secs = 0\n",
            "[runtime]\nopenssl = \"\"\n",
            "[certificates.\"a.example\"]\nkey_bits = 100000\n",
        ] {
            let mut file = NamedTempFile::new().expect("temp file should be created");
            write!(file, "{}", bad).expect("write should succeed");
            assert!(
                Config::load(file.path()).is_err(),
                "config should be rejected: {}",
                bad
            );
        }
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        assert!(Config::parse("[defaults]\ncountri = \"US\"\n").is_err());
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let path = Config::locate(Some(Path::new("/tmp/custom.toml")))
            .expect("explicit path should be used");
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn test_directories_meta_dir() {
        let dirs = Directories::under(Path::new("/srv/tls"));
        assert_eq!(dirs.meta_dir(), PathBuf::from("/srv/tls/certs/meta"));
        assert_eq!(dirs.key_dir, PathBuf::from("/srv/tls/private"));
    }
}
