//! Virtual path helpers.
//!
//! Virtual paths are `/`-separated strings, always absolute, with no trailing
//! slash except for the root itself. They are not `std::path::Path`s: they
//! name locations inside backends that may not be local filesystems.

/// Normalize a path: leading `/`, no trailing `/`, no empty, `.` or `..`
/// segments. `..` never climbs above the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Join a normalized directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{dir}/{name}"))
}

/// Split a path into (parent, name). The root's parent is itself.
pub fn split(path: &str) -> (String, String) {
    let path = normalize(path);
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), String::new()),
    }
}

/// Parent directory of a path.
pub fn parent(path: &str) -> String {
    split(path).0
}

/// Final component of a path (empty for the root).
pub fn base_name(path: &str) -> String {
    split(path).1
}

/// If `path` equals `prefix` or lies beneath it, return the remainder as a
/// normalized path (root for an exact match). Both inputs must be normalized.
pub fn strip_prefix(path: &str, prefix: &str) -> Option<String> {
    if prefix == "/" {
        return Some(path.to_string());
    }
    if path == prefix {
        return Some("/".to_string());
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

/// True when `path` lies strictly beneath `dir`. Both inputs normalized.
pub fn is_strict_descendant(path: &str, dir: &str) -> bool {
    path != dir && strip_prefix(path, dir).is_some()
}
