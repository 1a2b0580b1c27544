//! Confinement of client-supplied paths to the storage root.
//!
//! Resolution is purely lexical: `.` segments are dropped, `..` segments pop
//! the previous segment, and any `..` with nothing left to pop means the
//! path climbs above the root. Absolute paths (and Windows prefixes) are
//! rejected rather than re-rooted.

use std::path::{Component, Path, PathBuf};

use crate::error::{ServeError, ServeResult};

/// Normalize a client-supplied relative path.
///
/// Returns the normalized relative path, which is empty for `None`, `""`,
/// `"."`, or anything that normalizes back to the root.
pub fn normalize(relative: Option<&str>) -> ServeResult<PathBuf> {
    let raw = relative.unwrap_or("");
    let mut segments: Vec<&std::ffi::OsStr> = Vec::new();

    for component in Path::new(raw).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment) => segments.push(segment),
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(ServeError::PathEscape(raw.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ServeError::PathEscape(raw.to_string()));
            }
        }
    }

    Ok(segments.iter().collect())
}

/// Resolve `relative` against `root`, guaranteeing the result is `root`
/// itself or one of its descendants.
pub fn resolve(root: &Path, relative: Option<&str>) -> ServeResult<PathBuf> {
    Ok(root.join(normalize(relative)?))
}

/// Render a normalized relative path for messages, `/`-separated, with
/// `.` standing for the root.
pub fn relative_display(relative: &Path) -> String {
    let rendered = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if rendered.is_empty() {
        ".".to_string()
    } else {
        rendered
    }
}
