//! Path parsing and the search record carried through traversal.

use crate::fs::dir::Dir;
use crate::fs::FileType;

/// Successive components of `path`; repeated separators collapse, so
/// `/a//b/c` yields `a`, `b`, `c`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Component count to the leaf: `/a` is 1, `/a/b/c` is 3.
pub fn depth(path: &str) -> usize {
    components(path).count()
}

/// Leaf component, if any.
pub fn last_component(path: &str) -> Option<&str> {
    components(path).last()
}

/// What a traversal reached: the (still open) parent directory, the type of
/// the leaf if it was found, and the prefix actually walked. The prefix
/// distinguishes "parent exists, leaf missing" from "an intermediate
/// component is missing".
pub struct SearchRecord {
    pub parent: Dir,
    pub file_type: FileType,
    pub searched_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_collapse_slashes() {
        let got: Vec<_> = components("/a//b/c").collect();
        assert_eq!(got, ["a", "b", "c"]);
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b/c"), 3);
        assert_eq!(depth("/a//b"), 2);
    }
}
