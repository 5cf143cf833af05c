//! Virtual path normalization, prefix matching and containment.
//!
//! All client-supplied paths pass through [`normalize`] before anything else
//! looks at them. Normalization is purely lexical: `..` components are
//! resolved against the virtual root and climbing above it is an error, not
//! something to be trimmed away.

use crate::store::VirtualPath;
use std::path::{Path, PathBuf};

/// Problems with a client-supplied path, detected before any filesystem
/// access.
#[derive(Debug, PartialEq, Eq)]
pub enum PathError {
    /// Empty path or empty trailing component where a name is required.
    Empty,
    /// Embedded NUL byte.
    NulByte,
    /// The path climbs above the virtual root.
    Escape,
}

/// Normalize a client path to a canonical posix-style absolute virtual path.
///
/// Backslash separators and drive prefixes (FTP clients on Windows produce
/// both) are folded into posix form first; `.` and empty components vanish;
/// `..` pops. Relative input is taken relative to `/`.
pub fn normalize(raw: &str) -> Result<String, PathError> {
    if raw.is_empty() {
        return Err(PathError::Empty);
    }
    if raw.contains('\0') {
        return Err(PathError::NulByte);
    }
    let mut cleaned = raw.replace('\\', "/");
    let bytes = cleaned.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        cleaned = cleaned[2..].to_string();
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in cleaned.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError::Escape);
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Select the longest-prefix virtual path matching `path`. `rows` must be
/// ordered longest prefix first, which is how the store hands them out.
pub fn longest_match<'a>(rows: &'a [VirtualPath], path: &str) -> Option<&'a VirtualPath> {
    rows.iter().find(|vp| prefix_matches(&vp.virtual_path, path))
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    prefix == "/" || path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// The request path relative to the matched prefix, without a leading `/`.
pub fn relative_part<'a>(vp: &VirtualPath, path: &'a str) -> &'a str {
    path.strip_prefix(vp.virtual_path.as_str()).unwrap_or(path).trim_start_matches('/')
}

/// Map a normalized virtual path onto the matched row's local directory.
pub fn materialize(vp: &VirtualPath, path: &str) -> PathBuf {
    let rel = relative_part(vp, path);
    if rel.is_empty() {
        vp.local_path.clone()
    } else {
        vp.local_path.join(rel)
    }
}

/// Verify that `candidate` still lives under `root` once symlinks are
/// resolved. The deepest existing ancestor of `candidate` is
/// canonicalized and compared against the canonicalized root, so a symlink
/// pointing out of the tree is caught even when the leaf does not exist
/// yet.
pub async fn ensure_contained(root: &Path, candidate: &Path) -> Result<(), PathError> {
    let root_real = match tokio::fs::canonicalize(root).await {
        Ok(p) => p,
        // A missing virtual root cannot be escaped from; later I/O will
        // report the real problem.
        Err(_) => return Ok(()),
    };
    let mut probe = candidate.to_path_buf();
    let real = loop {
        match tokio::fs::canonicalize(&probe).await {
            Ok(resolved) => break resolved,
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => return Err(PathError::Escape),
            },
        }
    };
    if real.starts_with(&root_real) {
        Ok(())
    } else {
        Err(PathError::Escape)
    }
}
