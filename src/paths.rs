//! Path confinement for per-site file access.
//!
//! Every path a client supplies is interpreted relative to the site's root
//! directory. Resolution follows symlinks and collapses `.`/`..` before the
//! containment check, so a path is accepted only if the location the OS would
//! actually touch lies inside the root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{PanelError, display_relative};

/// A path that would leave its site root once resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("path escapes the site root: {relative}")]
pub struct Rejected {
    pub relative: String,
}

impl From<Rejected> for PanelError {
    fn from(rejected: Rejected) -> Self {
        PanelError::PathEscape(display_relative(&rejected.relative))
    }
}

/// Canonical root directory of one site.
#[derive(Debug, Clone)]
pub struct TenantRoot {
    path: PathBuf,
}

impl TenantRoot {
    /// Open a site root, creating the directory if it does not exist yet.
    pub fn open(path: &Path) -> io::Result<Self> {
        if !path.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "site root must be an absolute path",
            ));
        }

        if !path.exists() {
            fs::create_dir_all(path)?;
            info!("Created missing site root: {}", path.display());
        }

        let canonical = path.canonicalize()?;
        if !canonical.is_dir() {
            return Err(io::Error::other("site root is not a directory"));
        }

        Ok(Self { path: canonical })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolve(&self, relative: &str) -> Result<ConfinedPath, Rejected> {
        resolve(&self.path, relative)
    }

    /// Resolve `name` inside an already confined directory.
    pub fn resolve_child(&self, dir: &ConfinedPath, name: &str) -> Result<ConfinedPath, Rejected> {
        self.resolve(&join_relative(dir.relative(), name))
    }
}

/// A location proven to lie inside its site root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedPath {
    resolved: PathBuf,
    entry: PathBuf,
    relative: String,
}

impl ConfinedPath {
    /// Fully resolved location (symlinks followed).
    pub fn path(&self) -> &Path {
        &self.resolved
    }

    /// The directory entry named by the request, with the final component left
    /// unresolved. Mutations operate on this so that removing or renaming a
    /// symlink touches the link, not its target.
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// The path as the client supplied it, for messages.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn display(&self) -> String {
        display_relative(&self.relative)
    }

    pub fn is_root_of(&self, root: &TenantRoot) -> bool {
        self.resolved == root.path || self.entry == root.path
    }
}

/// Resolve `relative` against `root`.
///
/// A single leading separator is stripped so that `/photos` means the site's
/// `photos` directory. Components that do not exist yet are normalized
/// lexically; existence is for the caller to check.
pub fn resolve(root: &Path, relative: &str) -> Result<ConfinedPath, Rejected> {
    let rejected = || Rejected {
        relative: relative.to_string(),
    };

    if relative.contains('\0') {
        warn!("Path contains a NUL byte");
        return Err(rejected());
    }

    let canonical_root = canonicalize_lenient(root);
    let trimmed = relative.strip_prefix('/').unwrap_or(relative);
    let joined = canonical_root.join(trimmed);
    let resolved = canonicalize_lenient(&joined);

    if !resolved.starts_with(&canonical_root) {
        warn!(
            "Path escape rejected: {:?} resolved to {:?} outside {:?}",
            relative, resolved, canonical_root
        );
        return Err(rejected());
    }

    let entry = match (joined.components().next_back(), joined.parent()) {
        (Some(Component::Normal(name)), Some(parent)) => {
            let parent = canonicalize_lenient(parent);
            if parent.starts_with(&canonical_root) {
                parent.join(name)
            } else {
                resolved.clone()
            }
        }
        _ => resolved.clone(),
    };

    debug!("Resolved {:?} to {:?}", relative, resolved);

    Ok(ConfinedPath {
        resolved,
        entry,
        relative: relative.to_string(),
    })
}

/// Canonicalize as far as the filesystem allows.
///
/// Existing prefixes are resolved through the OS (following symlinks); the
/// remainder is normalized lexically.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let mut current = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => current.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                current.pop();
            }
            Component::Normal(name) => {
                let next = current.join(name);
                current = next.canonicalize().unwrap_or(next);
            }
        }
    }
    current
}

/// Join a client-relative directory and an item name with `/`.
pub fn join_relative(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Check that `name` names exactly one directory entry.
pub fn validate_item_name(name: &str) -> Result<&str, PanelError> {
    if name.is_empty() {
        return Err(PanelError::InvalidArgument("name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(PanelError::InvalidArgument(format!("invalid name: {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(PanelError::InvalidArgument(format!(
            "name must not contain path separators: {name:?}"
        )));
    }
    Ok(name)
}

/// Final component of an uploaded file's client-supplied name.
///
/// Browsers on some platforms send full paths; directory parts are dropped.
pub fn upload_basename(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}

/// Sanitize a filename by removing dangerous characters.
/// Returns None if the filename is empty after sanitization.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if sanitized.is_empty() {
        return None;
    }

    if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        return Some(sanitized[..end].to_string());
    }

    Some(sanitized.to_string())
}
