//! Slash-delimited resource paths
//!
//! Paths in the history are absolute, `/`-separated strings (`/src/main.rs`).
//! The root is `/`. Whether two names are the same depends on the host
//! filesystem, so every comparison goes through a [`Paths`] value carrying the
//! case-sensitivity setting.

use serde::{Deserialize, Serialize};

/// Path separator used by all recorded paths
pub const SEPARATOR: char = '/';

/// Path of the tree root
pub const ROOT: &str = "/";

/// Case-sensitivity aware path operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paths {
    case_sensitive: bool,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Paths {
    /// Create path rules for a filesystem with the given sensitivity
    pub fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    /// Whether names differing only in case are distinct
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Compare two single path components
    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a == b || a.to_lowercase() == b.to_lowercase()
        }
    }

    /// Compare two full paths component by component
    pub fn equals(&self, a: &str, b: &str) -> bool {
        let mut left = split(a);
        let mut right = split(b);
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) if self.names_equal(x, y) => continue,
                _ => return false,
            }
        }
    }

    /// Check whether `ancestor` contains `path`
    ///
    /// With `strict` a path is not its own ancestor.
    pub fn is_ancestor(&self, ancestor: &str, path: &str, strict: bool) -> bool {
        let mut outer = split(ancestor);
        let mut inner = split(path);
        loop {
            match (outer.next(), inner.next()) {
                (None, None) => return !strict,
                (None, Some(_)) => return true,
                (Some(_), None) => return false,
                (Some(x), Some(y)) => {
                    if !self.names_equal(x, y) {
                        return false;
                    }
                }
            }
        }
    }

    /// Path of `path` relative to `root`, without a leading separator
    ///
    /// Returns `None` if `path` is not inside `root`; `Some("")` if equal.
    pub fn relativize(&self, path: &str, root: &str) -> Option<String> {
        if !self.is_ancestor(root, path, false) {
            return None;
        }
        let skip = split(root).count();
        Some(split(path).skip(skip).collect::<Vec<_>>().join("/"))
    }

    /// Replace the `from` prefix of `path` with `to`
    ///
    /// Returns `None` when `path` is not `from` or below it.
    pub fn rebase(&self, path: &str, from: &str, to: &str) -> Option<String> {
        let rest = self.relativize(path, from)?;
        if rest.is_empty() {
            Some(normalize(to))
        } else {
            Some(append(to, &rest))
        }
    }
}

/// Iterate the non-empty components of a path
pub fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|c| !c.is_empty())
}

/// Canonical form: leading separator, no trailing or doubled separators
pub fn normalize(path: &str) -> String {
    let joined = split(path).collect::<Vec<_>>().join("/");
    format!("/{}", joined)
}

/// Last component of a path (empty for the root)
pub fn name(path: &str) -> &str {
    split(path).last().unwrap_or("")
}

/// Parent of a path, or `None` for the root
pub fn parent(path: &str) -> Option<String> {
    let components: Vec<&str> = split(path).collect();
    if components.is_empty() {
        return None;
    }
    Some(format!("/{}", components[..components.len() - 1].join("/")))
}

/// Append a relative path to a parent path
pub fn append(parent: &str, child: &str) -> String {
    let mut result = normalize(parent);
    for component in split(child) {
        if !result.ends_with(SEPARATOR) {
            result.push(SEPARATOR);
        }
        result.push_str(component);
    }
    result
}

/// Same parent, different last component
pub fn renamed(path: &str, new_name: &str) -> String {
    match parent(path) {
        Some(p) => append(&p, new_name),
        None => normalize(new_name),
    }
}

/// Check whether a path is the root
pub fn is_root(path: &str) -> bool {
    split(path).next().is_none()
}
