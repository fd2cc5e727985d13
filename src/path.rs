//! Slash-separated node paths with bracket syntax for array entries, e.g.
//! `"posts[3]/title"`. The root path is the empty string.

use std::fmt;

use crate::error::{Result, TreeError};

/// One step in a path: a property key of an object, or the index of an array
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKey {
    Key(String),
    Index(u32),
}

impl PathKey {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathKey::Key(key) => Some(key),
            PathKey::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            PathKey::Key(_) => None,
            PathKey::Index(index) => Some(*index),
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Key(key) => f.write_str(key),
            PathKey::Index(index) => write!(f, "[{index}]"),
        }
    }
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        PathKey::Key(key.into())
    }
}

impl From<u32> for PathKey {
    fn from(index: u32) -> Self {
        PathKey::Index(index)
    }
}

/// Splits a path into its keys. `""` yields no keys.
pub fn path_keys(path: &str) -> Result<Vec<PathKey>> {
    let mut keys = Vec::new();
    if path.is_empty() {
        return Ok(keys);
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(TreeError::InvalidArgument(format!(
                "empty segment in path \"{path}\""
            )));
        }
        let mut rest = segment;
        // Leading name part, if any, then zero or more [index] suffixes.
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                keys.push(PathKey::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(TreeError::InvalidArgument(format!(
                        "malformed array index in path \"{path}\""
                    )));
                }
                let close = rest.find(']').ok_or_else(|| {
                    TreeError::InvalidArgument(format!("unterminated index in path \"{path}\""))
                })?;
                let index: u32 = rest[1..close].parse().map_err(|_| {
                    TreeError::InvalidArgument(format!("invalid array index in path \"{path}\""))
                })?;
                keys.push(PathKey::Index(index));
                rest = &rest[close + 1..];
            }
        } else {
            keys.push(PathKey::Key(rest.to_string()));
        }
    }
    Ok(keys)
}

/// The last key of a path; `None` for the root.
pub fn path_key(path: &str) -> Result<Option<PathKey>> {
    Ok(path_keys(path)?.pop())
}

/// The parent path; `None` for the root.
pub fn parent_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let slash = path.rfind('/');
    let bracket = path.rfind('[');
    match (slash, bracket) {
        (Some(s), Some(b)) if b > s => Some(path[..b].to_string()),
        (Some(s), _) => Some(path[..s].to_string()),
        (None, Some(b)) if b > 0 => Some(path[..b].to_string()),
        _ => Some(String::new()),
    }
}

/// Appends one key to a path.
pub fn child_path(path: &str, key: &PathKey) -> String {
    match key {
        PathKey::Key(name) if path.is_empty() => name.clone(),
        PathKey::Key(name) => format!("{path}/{name}"),
        PathKey::Index(index) => format!("{path}[{index}]"),
    }
}

/// True when `ancestor` is a proper ancestor of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/') || rest.starts_with('['))
        .unwrap_or(false)
}

/// True when `path` is `other` or a descendant of it.
pub fn is_self_or_descendant(path: &str, other: &str) -> bool {
    path == other || is_ancestor(other, path)
}

/// True when the two paths lie on one root-to-leaf line.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_keys_and_indexes() {
        let keys = path_keys("posts[3]/comments[0]/text").expect("parse");
        assert_eq!(
            keys,
            vec![
                PathKey::Key("posts".into()),
                PathKey::Index(3),
                PathKey::Key("comments".into()),
                PathKey::Index(0),
                PathKey::Key("text".into()),
            ]
        );
        assert!(path_keys("").expect("root").is_empty());
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(path_keys("a//b").is_err());
        assert!(path_keys("a[b]").is_err());
        assert!(path_keys("a[1").is_err());
    }

    #[test]
    fn parent_handles_indexes() {
        assert_eq!(parent_path("a/b"), Some("a".into()));
        assert_eq!(parent_path("posts[3]"), Some("posts".into()));
        assert_eq!(parent_path("posts[3]/title"), Some("posts[3]".into()));
        assert_eq!(parent_path("a"), Some(String::new()));
        assert_eq!(parent_path(""), None);
    }

    #[test]
    fn child_path_round_trips_through_parent() {
        for (base, key) in [
            ("", PathKey::Key("a".into())),
            ("a/b", PathKey::Key("c".into())),
            ("posts", PathKey::Index(7)),
        ] {
            let child = child_path(base, &key);
            assert_eq!(parent_path(&child), Some(base.to_string()));
            assert_eq!(path_key(&child).expect("parse"), Some(key));
        }
    }

    #[test]
    fn ancestor_respects_segment_boundaries() {
        assert!(is_ancestor("", "a"));
        assert!(is_ancestor("a", "a/b"));
        assert!(is_ancestor("posts", "posts[2]/title"));
        assert!(!is_ancestor("a", "ab"));
        assert!(!is_ancestor("a/b", "a/b"));
        assert!(!is_ancestor("a/b", "a"));
    }

    #[test]
    fn overlap_is_symmetric() {
        assert!(paths_overlap("a", "a/b/c"));
        assert!(paths_overlap("a/b/c", "a"));
        assert!(paths_overlap("a", "a"));
        assert!(!paths_overlap("a/b", "a/c"));
    }
}
