// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::identity::CertificateIdentity;
use std::fmt::Write;

/// Produces the request config file for an identity.
///
/// Output must be a pure function of the identity: the executor compares it
/// byte for byte with the file on disk to decide whether the CSR is stale.
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, identity: &CertificateIdentity) -> String;
}

/// Renders an `openssl req` config with the subject and a SAN section.
#[derive(Debug, Clone, Default)]
pub struct OpensslConfigRenderer;

/// Section holding request and self-signed certificate extensions.
pub const EXTENSIONS_SECTION: &str = "v3_req";

impl ConfigRenderer for OpensslConfigRenderer {
    fn render(&self, identity: &CertificateIdentity) -> String {
        let with_san = !identity.alt_names().is_empty();
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(out, "# Managed by certkeeper. Local changes will be overwritten.");
        let _ = writeln!(out, "[ req ]");
        let _ = writeln!(out, "default_md = sha256");
        let _ = writeln!(out, "prompt = no");
        let _ = writeln!(out, "utf8 = yes");
        let _ = writeln!(out, "distinguished_name = req_distinguished_name");
        if with_san {
            let _ = writeln!(out, "req_extensions = {}", EXTENSIONS_SECTION);
            let _ = writeln!(out, "x509_extensions = {}", EXTENSIONS_SECTION);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "[ req_distinguished_name ]");
        let _ = writeln!(out, "C = {}", escape_value(identity.country()));
        let _ = writeln!(out, "ST = {}", escape_value(identity.state()));
        let _ = writeln!(out, "L = {}", escape_value(identity.city()));
        let _ = writeln!(out, "O = {}", escape_value(identity.org()));
        let _ = writeln!(out, "OU = {}", escape_value(identity.org_unit()));
        let _ = writeln!(out, "CN = {}", escape_value(identity.common_name()));

        if with_san {
            let _ = writeln!(out);
            let _ = writeln!(out, "[ {} ]", EXTENSIONS_SECTION);
            let _ = writeln!(out, "basicConstraints = CA:FALSE");
            let _ = writeln!(out, "keyUsage = digitalSignature, keyEncipherment");
            let _ = writeln!(out, "extendedKeyUsage = serverAuth");
            let _ = writeln!(out, "subjectAltName = @alt_names");
            let _ = writeln!(out);
            let _ = writeln!(out, "[ alt_names ]");
            for (i, name) in identity.alt_names().iter().enumerate() {
                let _ = writeln!(out, "DNS.{} = {}", i + 1, escape_value(name));
            }
        }

        out
    }
}

/// Escape characters the openssl config parser treats specially
/// (`$` variable expansion, `#` comments, `\` escapes, quotes).
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if matches!(c, '\\' | '$' | '#' | '"' | '\'') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{validate, IdentityInput};

    fn identity(alt_names: &[&str], org: &str) -> CertificateIdentity {
        validate(IdentityInput {
            common_name: "host.berkeley.edu".into(),
            alt_names: alt_names.iter().map(|s| s.to_string()).collect(),
            country: "US".into(),
            state: "CA".into(),
            city: "Berkeley".into(),
            org: org.into(),
            org_unit: "IT".into(),
        })
        .expect("identity should validate")
    }

    #[test]
    fn test_render_subject() {
        let config = OpensslConfigRenderer.render(&identity(&[], "UCB"));
        assert!(config.contains("[ req_distinguished_name ]\n"));
        assert!(config.contains("C = US\n"));
        assert!(config.contains("ST = CA\n"));
        assert!(config.contains("L = Berkeley\n"));
        assert!(config.contains("O = UCB\n"));
        assert!(config.contains("OU = IT\n"));
        assert!(config.contains("CN = host.berkeley.edu\n"));
        assert!(config.contains("prompt = no\n"));
    }

    #[test]
    fn test_render_san_always_lists_common_name() {
        let config = OpensslConfigRenderer.render(&identity(&[], "UCB"));
        assert!(config.contains("req_extensions = v3_req\n"));
        assert!(config.contains("subjectAltName = @alt_names\n"));
        assert!(config.contains("DNS.1 = host.berkeley.edu\n"));
        assert!(!config.contains("DNS.2"));
    }

    #[test]
    fn test_render_changes_with_alt_names() {
        let c1 = OpensslConfigRenderer.render(&identity(&[], "UCB"));
        let c2 = OpensslConfigRenderer.render(&identity(&["alt.example.edu"], "UCB"));
        assert_ne!(c1, c2);
        assert!(c2.contains("DNS.2 = alt.example.edu\n"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let id = identity(&["alt.example.edu"], "UCB");
        assert_eq!(
            OpensslConfigRenderer.render(&id),
            OpensslConfigRenderer.render(&id)
        );
    }

    #[test]
    fn test_render_escapes_special_characters() {
        let config = OpensslConfigRenderer.render(&identity(&[], "R$D #1"));
        assert!(config.contains("O = R\\$D \\#1\n"));
    }
}
