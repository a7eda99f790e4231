//! POSIX-style path helpers for remote paths.
//!
//! Remote paths never go through `std::path`, whose separator depends on the
//! local platform.

/// Collapse repeated separators, `.` and `..` segments and trailing slashes.
///
/// Absolute paths keep their leading `/`; the root normalizes to `/`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Parent directory of `path`, or `None` at the root (or for a single relative segment).
pub fn parent(path: &str) -> Option<String> {
    let normalized = normalize(path);
    if normalized == "/" || normalized.is_empty() {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(pos) => Some(normalized[..pos].to_string()),
        None => None,
    }
}

/// Append `name` to `dir`.
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir.ends_with('/') {
        normalize(&format!("{}{}", dir, name))
    } else {
        normalize(&format!("{}/{}", dir, name))
    }
}
