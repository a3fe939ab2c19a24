// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Two uppercase ASCII letters (ISO 3166 alpha-2 shape, not checked against the list).
static COUNTRY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("invalid country regex"));

static STATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z]+$").expect("invalid state regex"));

static CITY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z ]+$").expect("invalid city regex"));

/// Dot-separated labels of 1-63 alphanumerics or hyphens, no hyphen at either
/// end of a label, optional trailing dot.
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([a-z0-9]|[a-z0-9][a-z0-9-]{0,61}[a-z0-9])(\.([a-z0-9]|[a-z0-9][a-z0-9-]{0,61}[a-z0-9]))*\.?$")
        .expect("invalid hostname regex")
});

/// Maximum length of a hostname in presentation form, without the trailing dot.
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Unvalidated identity fields as they come from configuration or the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityInput {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub country: String,
    pub state: String,
    pub city: String,
    pub org: String,
    pub org_unit: String,
}

/// A validated certificate subject. Only obtainable through [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateIdentity {
    common_name: String,
    alt_names: Vec<String>,
    country: String,
    state: String,
    city: String,
    org: String,
    org_unit: String,
}

impl CertificateIdentity {
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Canonical Subject Alternative Names. The first entry is always the common name.
    pub fn alt_names(&self) -> &[String] {
        &self.alt_names
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn org_unit(&self) -> &str {
        &self.org_unit
    }

    /// Stem of every artifact file name. The common name is already
    /// canonical, so spellings differing only in case or a trailing dot
    /// share one set of files.
    pub fn file_stem(&self) -> &str {
        &self.common_name
    }
}

/// Validate raw identity fields.
///
/// Checks run in a fixed order (country, state, city, org, org unit, common
/// name, alternate names) and the first failure is returned. Nothing is
/// written anywhere. The common name comes back in [`canonical_name`] form.
pub fn validate(input: IdentityInput) -> Result<CertificateIdentity> {
    if !COUNTRY_REGEX.is_match(&input.country) {
        return Err(Error::InvalidFormat {
            field: "country",
            value: input.country,
            reason: "must be exactly two uppercase letters".into(),
        });
    }

    if !STATE_REGEX.is_match(&input.state) {
        return Err(Error::InvalidFormat {
            field: "state",
            value: input.state,
            reason: "must contain letters only".into(),
        });
    }

    if !CITY_REGEX.is_match(&input.city) {
        return Err(Error::InvalidFormat {
            field: "city",
            value: input.city,
            reason: "must contain letters and spaces only".into(),
        });
    }

    if input.org.trim().is_empty() {
        return Err(Error::EmptyField("org"));
    }
    if input.org_unit.trim().is_empty() {
        return Err(Error::EmptyField("org_unit"));
    }

    validate_hostname(&input.common_name)?;
    if input.common_name.starts_with('*') {
        return Err(Error::InvalidHostname {
            name: input.common_name,
            reason: "common name cannot be a wildcard".into(),
        });
    }

    for name in &input.alt_names {
        validate_alt_name(name)?;
    }

    let common_name = canonical_name(&input.common_name);
    let alt_names = canonical_alt_names(&common_name, &input.alt_names);

    Ok(CertificateIdentity {
        common_name,
        alt_names,
        country: input.country,
        state: input.state,
        city: input.city,
        org: input.org,
        org_unit: input.org_unit,
    })
}

/// Check a name against the DNS hostname grammar.
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidHostname {
            name: name.to_string(),
            reason: "hostname cannot be empty".into(),
        });
    }

    if name.trim_end_matches('.').len() > MAX_HOSTNAME_LEN {
        return Err(Error::InvalidHostname {
            name: name.to_string(),
            reason: format!("longer than {} characters", MAX_HOSTNAME_LEN),
        });
    }

    if !HOSTNAME_REGEX.is_match(name) {
        return Err(Error::InvalidHostname {
            name: name.to_string(),
            reason: "labels must be 1-63 letters, digits or hyphens and not start or end with a hyphen"
                .into(),
        });
    }

    Ok(())
}

/// Alternate names may additionally carry a single leading `*.` wildcard label.
fn validate_alt_name(name: &str) -> Result<()> {
    match name.strip_prefix("*.") {
        Some(rest) => validate_hostname(rest).map_err(|e| match e {
            Error::InvalidHostname { reason, .. } => Error::InvalidHostname {
                name: name.to_string(),
                reason,
            },
            other => other,
        }),
        None => validate_hostname(name),
    }
}

/// Lowercase `name` and drop a trailing dot.
///
/// Hostnames compare case-insensitively, and `host.example.` names the same
/// host as `host.example`.
pub fn canonical_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Flatten the common name and alternate names into one ordered set.
///
/// Comparison ignores ASCII case and a trailing dot; the first spelling wins.
pub fn canonical_alt_names(common_name: &str, alt_names: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    std::iter::once(common_name)
        .chain(alt_names.iter().map(String::as_str))
        .filter(|name| seen.insert(name.trim_end_matches('.').to_ascii_lowercase()))
        .map(str::to_string)
        .collect()
}
