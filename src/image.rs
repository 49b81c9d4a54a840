//! Image references and toolchain pins
//!
//! Builds are only reproducible when every input is named exactly, so both
//! images and the rustup channel are validated before any engine call.

use crate::error::{KilnError, KilnResult};
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

/// How strictly an image tag must be pinned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// Tag must start with an exact `X.Y.Z` version (toolchain images)
    Versioned,
    /// Any explicit tag except `latest` (runtime base images)
    Tagged,
}

/// A parsed container image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository including registry host, e.g. `docker.io/library/rust`
    pub repository: String,
    /// Tag, if present
    pub tag: Option<String>,
    /// Content digest (`sha256:...`), if present
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference like `registry/repo:tag@sha256:...`
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(KilnError::User(format!(
                "Invalid image reference: {:?}",
                reference
            )));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") || digest.len() != "sha256:".len() + 64 {
                    return Err(KilnError::User(format!(
                        "Invalid image digest in {}",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are registry ports
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(KilnError::User(format!(
                "Invalid image reference: {}",
                reference
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Parse a reference an image can be tagged with.
    ///
    /// Repository path components must be lowercase (`[a-z0-9._-]`, starting
    /// and ending alphanumeric); a leading registry host may carry a port.
    /// Digests cannot be assigned, so they are rejected.
    pub fn parse_tag(reference: &str) -> KilnResult<Self> {
        let image = Self::parse(reference)?;
        let invalid = |reason: &str| {
            Err(KilnError::User(format!(
                "Invalid image tag {:?}: {}",
                reference, reason
            )))
        };

        if image.digest.is_some() {
            return invalid("a digest cannot be used as a tag");
        }

        let mut components: Vec<&str> = image.repository.split('/').collect();
        let first = components[0];
        if components.len() > 1
            && (first.contains('.') || first.contains(':') || first == "localhost")
        {
            components.remove(0);
        }
        if !components.iter().all(|c| is_valid_path_component(c)) {
            return invalid("repository names must be lowercase letters, digits, '.', '_' or '-'");
        }

        if let Some(tag) = &image.tag {
            let valid = tag.len() <= 128
                && !tag.starts_with(['.', '-'])
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !valid {
                return invalid("tags may only contain letters, digits, '_', '.' and '-'");
            }
        }

        Ok(image)
    }

    /// Parse and enforce a pin policy in one step
    pub fn parse_pinned(reference: &str, what: &str, policy: PinPolicy) -> KilnResult<Self> {
        let image = Self::parse(reference)?;
        image.ensure_pinned(what, policy)?;
        Ok(image)
    }

    /// Reject floating references
    pub fn ensure_pinned(&self, what: &str, policy: PinPolicy) -> KilnResult<()> {
        let reject = |reason: &str| {
            Err(KilnError::PinRequired {
                what: what.to_string(),
                value: self.to_string(),
                reason: reason.to_string(),
            })
        };

        // A digest names the exact content whatever the tag says
        if self.digest.is_some() {
            return Ok(());
        }

        let tag = match self.tag.as_deref() {
            Some(tag) => tag,
            None => return reject("no tag given, which resolves to latest"),
        };

        if tag == "latest" {
            return reject("latest is a floating tag");
        }

        if policy == PinPolicy::Versioned {
            let version = tag.split('-').next().unwrap_or(tag);
            if semver::Version::parse(version).is_err() {
                return reject("tag must start with an exact X.Y.Z version");
            }
        }

        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn is_valid_path_component(component: &str) -> bool {
    let edges_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    edges_ok(component.chars().next())
        && edges_ok(component.chars().last())
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// A pinned rustup channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainChannel {
    /// Exact release, e.g. `1.82.0`
    Release(semver::Version),
    /// Dated pre-release channel, e.g. `nightly-2024-10-01`
    Dated { channel: String, date: NaiveDate },
}

impl ToolchainChannel {
    /// The name passed to rustup
    pub fn rustup_name(&self) -> String {
        self.to_string()
    }
}

impl FromStr for ToolchainChannel {
    type Err = KilnError;

    fn from_str(s: &str) -> KilnResult<Self> {
        let s = s.trim();
        let reject = |reason: &str| {
            Err(KilnError::PinRequired {
                what: "toolchain channel".to_string(),
                value: s.to_string(),
                reason: reason.to_string(),
            })
        };

        match s {
            "stable" | "beta" | "nightly" => return reject("named channels move between builds"),
            "" => return reject("empty channel"),
            _ => {}
        }

        for channel in ["nightly", "beta"] {
            if let Some(date) = s.strip_prefix(channel).and_then(|d| d.strip_prefix('-')) {
                return match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                    Ok(date) => Ok(Self::Dated {
                        channel: channel.to_string(),
                        date,
                    }),
                    Err(_) => reject("expected a YYYY-MM-DD date"),
                };
            }
        }

        match semver::Version::parse(s) {
            Ok(version) if version.pre.is_empty() && version.build.is_empty() => {
                Ok(Self::Release(version))
            }
            _ => reject("expected X.Y.Z, nightly-YYYY-MM-DD or beta-YYYY-MM-DD"),
        }
    }
}

impl fmt::Display for ToolchainChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release(version) => write!(f, "{}", version),
            Self::Dated { channel, date } => write!(f, "{}-{}", channel, date.format("%Y-%m-%d")),
        }
    }
}
