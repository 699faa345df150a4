//! Lexical path normalization.

use std::path::{Component, Path, PathBuf};

use crate::error::{VfsError, VfsResult};

/// Normalize a request path by collapsing `.` and `..` components without
/// touching the filesystem.
///
/// # Errors
///
/// Returns [`VfsError::PermissionDenied`] for absolute paths and for paths
/// whose `..` components would climb above the sandbox root.
pub fn normalize(name: &str) -> VfsResult<PathBuf> {
    let mut resolved = PathBuf::new();

    for component in Path::new(name).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(VfsError::PermissionDenied(format!(
                    "absolute paths are not allowed: {name}"
                )));
            },
            Component::CurDir => {},
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(VfsError::PermissionDenied(format!(
                        "path escapes sandbox root: {name}"
                    )));
                }
            },
            Component::Normal(part) => resolved.push(part),
        }
    }

    Ok(resolved)
}
