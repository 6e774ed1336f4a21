//! Path helpers shared by the identity resolver, the document store and the watcher.
//!
//! Requests address documents with "api paths": `/`-separated strings relative to the served
//! root (`nb.ipynb`, `dir/nb.ipynb`). The identity store and the filesystem watcher speak in
//! absolute OS paths. Everything that crosses between the two goes through this module so both
//! sides agree on a single key for the same file.

use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .map(|c| match c {
            Component::RootDir => Cow::from("".to_string()),
            _ => c.as_os_str().to_string_lossy(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.replace('/', MAIN_SEPARATOR_STR))
}

/// Lexically normalize a path: drop `.` components and fold `..` into its parent.
///
/// Does not touch the filesystem, so it works for paths that were just deleted.
pub fn clean_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    cleaned.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                let ends_in_parent =
                    matches!(cleaned.components().next_back(), Some(Component::ParentDir));
                if at_root && cleaned.has_root() {
                    // "/.." is "/"
                } else if at_root || ends_in_parent {
                    cleaned.push("..");
                } else {
                    cleaned.pop();
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Strip leading separators from a request path. Returns `None` if nothing is left.
pub fn trim_api_path(api_path: &str) -> Option<&str> {
    let trimmed = api_path.trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Resolve an api path (or an already absolute path) against `root`.
pub fn api_to_os_path(root: &Path, api_path: &str) -> PathBuf {
    let os_path = string_to_os_path(api_path);
    if os_path.is_absolute() {
        clean_path(os_path)
    } else {
        clean_path(root.join(os_path))
    }
}

/// Resolve a request path below `root`. `None` if the cleaned path leaves the root.
pub fn api_to_contained_os_path(root: &Path, api_path: &str) -> Option<PathBuf> {
    let os_path = api_to_os_path(root, api_path);
    os_path.starts_with(clean_path(root)).then_some(os_path)
}

/// Express `os_path` relative to `root` as an api path. Paths outside of `root` are returned
/// whole, `/`-separated.
pub fn os_to_api_path(root: &Path, os_path: &Path) -> String {
    match os_path.strip_prefix(root) {
        Ok(relative) => os_path_to_string(relative),
        Err(_) => os_path_to_string(os_path),
    }
}
