//! Path relativization against the cache and dataset directories.
//!
//! Paths are compared component by component, never as raw strings, so
//! `/data/set` is not treated as a prefix of `/data/settings/x.jpg`.

use std::path::{Component, Path, PathBuf};

/// Express `path` relative to the first of `bases` that contains it.
///
/// Bases are tried in order, lexically first and then after
/// canonicalizing both sides (which resolves `..` and symlinks when the
/// files exist). The result uses `/` separators.
pub fn relative_path(path: &Path, bases: &[&Path]) -> Option<String> {
    for base in bases {
        if let Ok(rel) = path.strip_prefix(base) {
            if let Some(s) = to_portable(rel) {
                return Some(s);
            }
        }
    }

    let canonical = path.canonicalize().ok()?;
    for base in bases {
        let Ok(base) = base.canonicalize() else {
            continue;
        };
        if let Ok(rel) = canonical.strip_prefix(&base) {
            if let Some(s) = to_portable(rel) {
                return Some(s);
            }
        }
    }
    None
}

/// Resolve a client-supplied dataset path against `base`.
///
/// Relative paths are joined onto `base`; absolute paths must lie inside
/// it. Returns the absolute path and the path relative to `base`, or
/// `None` if the path escapes the base directory.
pub fn resolve_under_base(path: &Path, base: &Path) -> Option<(PathBuf, String)> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return None;
        }
        base.join(path)
    };
    let rel = relative_path(&absolute, &[base])?;
    Some((absolute, rel))
}

fn to_portable(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
