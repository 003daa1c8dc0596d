//! Path validation and normalization.
//!
//! Two flavours of path exist:
//! - **Logical paths** are what the cache and the UI use (`/notes/today.md`,
//!   or `today.md` for root-level entries). [`normalize`] cleans them up but
//!   keeps a leading slash if there was one.
//! - **Storage keys** are what backends use: always relative to the backend
//!   root, never escaping it. [`validate`] turns a logical path into a key.

use std::path::{Component, Path};

use crate::error::{ErrorKind, Result};

/// Resolve a path into its normal components, refusing anything that would
/// escape the root.
fn components(path: &str) -> Result<Vec<String>> {
    // Use Rust's built-in path component parser for robust handling.
    let mut components = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls, reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.to_string()));
                }
                components.push(s.to_string_lossy().into_owned())
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.to_string())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_string()));
                }
            },
        }
    }
    Ok(components)
}

/// Validates a path and converts it into a storage key relative to the
/// backend root. Ensures that paths don't escape the storage root (no `..`
/// traversal).
///
/// # Examples
///
/// ```
/// use verve_storage::validate_path;
/// // Valid paths
/// assert_eq!(validate_path("/notes/today.md").unwrap(), "notes/today.md");
/// assert!(validate_path("a/../file.md").is_ok()); // (never leaves root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves root)
/// assert!(validate_path("a\0b").is_err());
/// assert!(validate_path("/").is_err());
/// ```
pub fn validate(path: impl AsRef<str>) -> Result<String> {
    let path = path.as_ref();
    let components = components(path)?;
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.to_string())),
        false => Ok(components.join("/")),
    }
}

/// Normalize a logical workspace path, keeping a leading slash if present.
///
/// ```
/// use verve_storage::path::normalize;
/// assert_eq!(normalize("/a//b/./c.md").unwrap(), "/a/b/c.md");
/// assert_eq!(normalize("root.md").unwrap(), "root.md");
/// ```
pub fn normalize(path: impl AsRef<str>) -> Result<String> {
    let path = path.as_ref();
    let key = validate(path)?;
    Ok(match path.starts_with('/') {
        true => format!("/{key}"),
        false => key,
    })
}

/// Join a single, non-empty name onto a parent directory. Root-level parents
/// (empty or `/`) produce an unprefixed path.
///
/// ```
/// use verve_storage::path::join;
/// assert_eq!(join("", "root-new.md").unwrap(), "root-new.md");
/// assert_eq!(join("/", "root-new.md").unwrap(), "root-new.md");
/// assert_eq!(join("/notes", "a.md").unwrap(), "/notes/a.md");
/// ```
pub fn join(parent: impl AsRef<str>, name: impl AsRef<str>) -> Result<String> {
    let (parent, name) = (parent.as_ref(), name.as_ref());
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        exn::bail!(ErrorKind::InvalidPath(name.to_string()));
    }
    match parent.trim_matches('/').is_empty() {
        true => normalize(name),
        false => normalize(format!("{}/{name}", parent.trim_end_matches('/'))),
    }
}

/// Leaf component of a logical path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Parent directory of a logical path. Root-level entries have `None`.
///
/// ```
/// use verve_storage::path::parent;
/// assert_eq!(parent("/notes/a.md"), Some("/notes"));
/// assert_eq!(parent("/a.md"), None);
/// assert_eq!(parent("a.md"), None);
/// ```
pub fn parent(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

/// Whether `path` lies strictly inside directory `dir` (logical paths).
///
/// Comparison is component-based: `/a/bc` is not inside `/a/b`.
pub fn is_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    match path.strip_prefix(dir) {
        Some(rest) => rest.starts_with('/') && rest.len() > 1,
        None => false,
    }
}
