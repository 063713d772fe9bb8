//! Virtual path canonicalization and case folding
//!
//! Virtual paths arrive from intercepted calls in whatever spelling the
//! application used: either separator style, device prefixes, relative
//! segments. Everything past this module works on the canonical form.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Device and volume prefixes stripped during canonicalization
const DEVICE_PREFIXES: [&str; 4] = ["//?/", "//./", "/??/", "//"];

/// A canonicalized virtual path: ordered components with original case
/// preserved. The empty component list is the synthetic root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    components: Vec<String>,
}

impl VirtualPath {
    /// The synthetic root
    pub fn root() -> Self {
        VirtualPath { components: Vec::new() }
    }

    /// Canonicalize a raw path: unify separators, drop device prefixes,
    /// resolve `.` and `..`. A `..` that would escape the root fails
    /// with `PathInvalid`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut normalized = raw.replace('\\', "/");

        for prefix in DEVICE_PREFIXES {
            if normalized.starts_with(prefix) {
                normalized = normalized[prefix.len()..].to_string();
                break;
            }
        }

        let mut components: Vec<String> = Vec::new();
        for part in normalized.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(Error::PathInvalid(raw.to_string()));
                    }
                }
                other => components.push(other.to_string()),
            }
        }

        Ok(VirtualPath { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Last component, if any
    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Path with the last component dropped; root's parent is root
    pub fn parent(&self) -> VirtualPath {
        let mut components = self.components.clone();
        components.pop();
        VirtualPath { components }
    }

    /// Append a single component
    pub fn join(&self, name: &str) -> VirtualPath {
        let mut components = self.components.clone();
        components.push(name.to_string());
        VirtualPath { components }
    }

    /// Case-folded key for tracker maps and child lookups
    pub fn key(&self) -> String {
        fold(&self.to_string())
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

/// Case-fold a string for comparison; original spelling is stored
/// alongside wherever the fold is used as a key
pub fn fold(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

/// Case-insensitive equality
pub fn eq_fold(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}

/// Case-insensitive suffix test
pub fn ends_with_fold(value: &str, suffix: &str) -> bool {
    fold(value).ends_with(&fold(suffix))
}

/// Case-insensitive substring test
pub fn contains_fold(haystack: &str, needle: &str) -> bool {
    fold(haystack).contains(&fold(needle))
}

/// Split a real (host) path into components for inverse tree keying.
/// Separator style and device prefixes are handled like virtual paths;
/// a drive specifier stays as the first component.
pub fn real_components(raw: &str) -> Vec<String> {
    let mut normalized = raw.replace('\\', "/");

    for prefix in DEVICE_PREFIXES {
        if normalized.starts_with(prefix) {
            normalized = normalized[prefix.len()..].to_string();
            break;
        }
    }

    normalized
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(|part| part.to_string())
        .collect()
}

/// Join a real root with the uncovered suffix of a virtual path
pub fn real_candidate(root: &str, suffix: &[String]) -> PathBuf {
    let mut path = PathBuf::from(root);
    for component in suffix {
        path.push(component);
    }
    path
}
