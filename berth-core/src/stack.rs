//! Stack name and path resolution.
//!
//! Every operation is scoped to a stack: a named directory directly under
//! the configured stack root. Names are validated against a conservative
//! pattern and resolved paths are canonicalized and checked for containment
//! before anything touches the filesystem.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

static STACK_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("stack name pattern"));

#[derive(Error, Debug)]
pub enum StackPathError {
    #[error("invalid stack name: {0:?}")]
    InvalidName(String),

    #[error("stack not found: {0}")]
    NotFound(String),

    #[error("path {0:?} resolves outside the stack root")]
    OutsideRoot(PathBuf),

    #[error("invalid sub-path: {0:?}")]
    InvalidSubPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackPathError {
    /// Stable machine-readable code carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "invalid-stack-name",
            Self::NotFound(_) => "stack-not-found",
            Self::OutsideRoot(_) | Self::InvalidSubPath(_) => "path-outside-stack",
            Self::Io(_) => "io-error",
        }
    }
}

/// Returns whether `name` is an acceptable stack name.
pub fn is_valid_stack_name(name: &str) -> bool {
    STACK_NAME.is_match(name)
}

/// Resolve a stack name to its directory under `root`.
///
/// The directory must exist, and its canonical form must remain inside the
/// canonical stack root. Symlinked stack dirs pointing elsewhere are refused.
pub fn resolve_stack(root: &Path, name: &str) -> Result<PathBuf, StackPathError> {
    if !is_valid_stack_name(name) {
        return Err(StackPathError::InvalidName(name.to_string()));
    }

    let canonical_root = root.canonicalize()?;
    let candidate = canonical_root.join(name);
    let canonical = candidate
        .canonicalize()
        .map_err(|_| StackPathError::NotFound(name.to_string()))?;

    if !canonical.starts_with(&canonical_root) {
        return Err(StackPathError::OutsideRoot(candidate));
    }

    Ok(canonical)
}

/// Resolve a relative sub-path inside an already-resolved stack directory.
///
/// Absolute paths and any post-clean `..` component are rejected. The result
/// may name a file that does not exist yet (archive outputs), so only the
/// lexical form is checked here; callers that open the path re-verify the
/// canonical parent where it matters.
pub fn resolve_subpath(stack_dir: &Path, sub: &Path) -> Result<PathBuf, StackPathError> {
    if sub.is_absolute() {
        return Err(StackPathError::InvalidSubPath(sub.to_path_buf()));
    }

    let mut cleaned = PathBuf::new();
    for component in sub.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(StackPathError::InvalidSubPath(sub.to_path_buf()));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StackPathError::InvalidSubPath(sub.to_path_buf()));
            }
        }
    }

    Ok(stack_dir.join(cleaned))
}

/// Containment check for paths produced outside [`resolve_subpath`],
/// e.g. archive entry destinations. Both sides are compared lexically;
/// `base` is expected to already be canonical.
pub fn is_within(base: &Path, candidate: &Path) -> bool {
    candidate.starts_with(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_simple_names() {
        for name in ["web", "my-stack", "a", "stack.v2", "x_y", "0abc"] {
            assert!(is_valid_stack_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_traversal_and_metacharacters() {
        for name in ["../escape", "", ".hidden", "-lead", "a/b", "a b", "a\tb"] {
            assert!(!is_valid_stack_name(name), "{name} should be invalid");
        }
        let too_long = "a".repeat(65);
        assert!(!is_valid_stack_name(&too_long));
    }

    #[test]
    fn resolve_stack_requires_existing_dir() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("web")).unwrap();

        let resolved = resolve_stack(root.path(), "web").unwrap();
        assert!(resolved.ends_with("web"));

        let err = resolve_stack(root.path(), "missing").unwrap_err();
        assert!(matches!(err, StackPathError::NotFound(_)));
    }

    #[test]
    fn resolve_stack_rejects_traversal() {
        let root = TempDir::new().unwrap();
        let err = resolve_stack(root.path(), "../escape").unwrap_err();
        assert!(matches!(err, StackPathError::InvalidName(_)));
        assert!(err.to_string().contains("invalid stack"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_stack_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let err = resolve_stack(root.path(), "link").unwrap_err();
        assert!(matches!(err, StackPathError::OutsideRoot(_)));
    }

    #[test]
    fn subpath_rejects_parent_components() {
        let stack = Path::new("/opt/compose/web");
        assert!(resolve_subpath(stack, Path::new("../other")).is_err());
        assert!(resolve_subpath(stack, Path::new("data/../../other")).is_err());
        assert!(resolve_subpath(stack, Path::new("/etc/passwd")).is_err());

        let ok = resolve_subpath(stack, Path::new("./data/./db")).unwrap();
        assert_eq!(ok, PathBuf::from("/opt/compose/web/data/db"));
    }
}
