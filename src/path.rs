//! Path splitting
//!
//! Paths are `/`-separated and always relative to the volume root; repeated
//! and trailing separators are ignored. `.` and `..` are not special here:
//! they resolve through the directory entries every directory carries.

/// Separator between path components
pub const SEPARATOR: char = '/';

/// Non-empty components of `path`
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|component| !component.is_empty())
}

/// Split into (parent path, final component); `None` for the root itself
pub fn split_parent(path: &str) -> Option<(String, &str)> {
    let mut parts: Vec<&str> = components(path).collect();
    let name = parts.pop()?;

    let mut parent = String::with_capacity(path.len());
    parent.push(SEPARATOR);
    parent.push_str(&parts.join("/"));
    Some((parent, name))
}
