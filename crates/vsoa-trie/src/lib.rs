//! Segment trie for VSOA URL matching, shared by subscription fan-out and RPC routing.
//!
//! Path rules (see `vsoa_server_add_listener`/`vsoa_server_publish`):
//! - `/a/b/c` matches only the literal path `/a/b/c`.
//! - `/a/b/c/` (trailing slash) matches `/a/b/c` and everything under it.
//! - `/` is the catch-all root, matching every path.

use hashbrown::HashMap;
use std::hash::Hash;

fn segments(path: &[u8]) -> Vec<&[u8]> {
    path.split(|&b| b == b'/').filter(|s| !s.is_empty()).collect()
}

/// `true` if `pattern` is a trailing-slash (prefix) pattern, i.e. `/` or `/a/b/`.
pub fn is_prefix_pattern(pattern: &[u8]) -> bool {
    pattern == b"/" || pattern.ends_with(b"/")
}

struct Node<T> {
    children: HashMap<Vec<u8>, Node<T>>,
    exact: Vec<T>,
    prefix: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Node<T> {
        Node { children: HashMap::new(), exact: Vec::new(), prefix: Vec::new() }
    }
}

/// A trie mapping URL patterns to values of type `T`. Insertion of an equal value under the
/// same pattern is idempotent (matches `vsoa_server_subscribe`'s "subscribe twice, one entry"
/// rule).
///
/// `index` tracks, per value, which patterns it's registered under, so `remove_all` can tear a
/// client's whole subscription set down in time proportional to its subscription count instead
/// of walking every node in the trie.
pub struct Trie<T> {
    root: Node<T>,
    index: HashMap<T, Vec<Vec<u8>>>,
}

impl<T: Eq + Clone + Hash> Trie<T> {
    pub fn new() -> Trie<T> {
        Trie { root: Node::default(), index: HashMap::new() }
    }

    /// Inserts `value` under `pattern`. Returns `false` if it was already present (still a
    /// successful, idempotent no-op).
    pub fn insert(&mut self, pattern: &[u8], value: T) -> bool {
        let prefix_mode = is_prefix_pattern(pattern);
        let node = self.descend_mut(pattern);
        let bucket = if prefix_mode { &mut node.prefix } else { &mut node.exact };
        if bucket.contains(&value) {
            false
        } else {
            bucket.push(value.clone());
            self.index.entry(value).or_insert_with(Vec::new).push(pattern.to_vec());
            true
        }
    }

    pub fn remove(&mut self, pattern: &[u8], value: &T) -> bool {
        let prefix_mode = is_prefix_pattern(pattern);
        let removed = match self.descend_find_mut(pattern) {
            Some(node) => {
                let bucket = if prefix_mode { &mut node.prefix } else { &mut node.exact };
                let before = bucket.len();
                bucket.retain(|v| v != value);
                bucket.len() != before
            }
            None => false,
        };
        if removed {
            if let Some(patterns) = self.index.get_mut(value) {
                if let Some(pos) = patterns.iter().position(|p| p.as_slice() == pattern) {
                    patterns.remove(pos);
                }
                if patterns.is_empty() {
                    self.index.remove(value);
                }
            }
        }
        removed
    }

    /// Removes every entry belonging to `value`, across all patterns. Used to tear down a
    /// client's whole subscription set in one pass: only the patterns `value` is actually
    /// registered under are visited, not the whole trie.
    pub fn remove_all(&mut self, value: &T) {
        let Some(patterns) = self.index.remove(value) else { return };
        for pattern in patterns {
            let prefix_mode = is_prefix_pattern(&pattern);
            if let Some(node) = self.descend_find_mut(&pattern) {
                let bucket = if prefix_mode { &mut node.prefix } else { &mut node.exact };
                bucket.retain(|v| v != value);
            }
        }
    }

    /// All values whose pattern matches `url`: the exact entry at `url` (if any) plus every
    /// prefix entry registered at `url` or any of its ancestors.
    pub fn matches(&self, url: &[u8]) -> Vec<T> {
        let segs = segments(url);
        let mut out = Vec::new();
        let mut node = &self.root;
        out.extend(node.prefix.iter().cloned());
        for seg in &segs {
            match node.children.get(*seg) {
                Some(next) => {
                    node = next;
                    out.extend(node.prefix.iter().cloned());
                }
                None => return out,
            }
        }
        out.extend(node.exact.iter().cloned());
        out
    }

    /// RPC routing lookup: the exact handler at `url` if registered, otherwise the handler of
    /// the deepest matching trailing-slash ancestor, otherwise the root `/` handler.
    pub fn best_match(&self, url: &[u8]) -> Option<&T> {
        let segs = segments(url);
        let mut node = &self.root;
        let mut best_prefix = node.prefix.first();
        for seg in &segs {
            match node.children.get(*seg) {
                Some(next) => {
                    node = next;
                    if let Some(v) = node.prefix.first() {
                        best_prefix = Some(v);
                    }
                }
                None => return best_prefix,
            }
        }
        node.exact.first().or(best_prefix)
    }

    /// Whether a value is already registered under exactly `pattern` (exact or prefix bucket
    /// matching the pattern's own mode). Used by RPC listener registration to reject duplicates.
    pub fn has_pattern(&self, pattern: &[u8]) -> bool {
        let prefix_mode = is_prefix_pattern(pattern);
        let segs = segments(pattern);
        let mut node = &self.root;
        for seg in segs {
            match node.children.get(seg) {
                Some(next) => node = next,
                None => return false,
            }
        }
        if prefix_mode {
            !node.prefix.is_empty()
        } else {
            !node.exact.is_empty()
        }
    }

    fn descend_mut(&mut self, pattern: &[u8]) -> &mut Node<T> {
        let segs = segments(pattern);
        let mut node = &mut self.root;
        for seg in segs {
            node = node.children.entry(seg.to_vec()).or_insert_with(Node::default);
        }
        node
    }

    fn descend_find_mut(&mut self, pattern: &[u8]) -> Option<&mut Node<T>> {
        let segs = segments(pattern);
        let mut node = &mut self.root;
        for seg in segs {
            node = node.children.get_mut(seg)?;
        }
        Some(node)
    }
}

impl<T: Eq + Clone + Hash> Default for Trie<T> {
    fn default() -> Trie<T> {
        Trie::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_itself() {
        let mut trie: Trie<u32> = Trie::new();
        trie.insert(b"/a/b/c", 1);
        assert_eq!(trie.matches(b"/a/b/c"), vec![1]);
        assert!(trie.matches(b"/a/b/c/x").is_empty());
        assert!(trie.matches(b"/a/b").is_empty());
    }

    #[test]
    fn prefix_pattern_matches_self_and_descendants() {
        let mut trie: Trie<u32> = Trie::new();
        trie.insert(b"/a/b/c/", 1);
        assert_eq!(trie.matches(b"/a/b/c"), vec![1]);
        assert_eq!(trie.matches(b"/a/b/c/x"), vec![1]);
        assert!(trie.matches(b"/a/b").is_empty());
    }

    #[test]
    fn root_prefix_catches_everything() {
        let mut trie: Trie<u32> = Trie::new();
        trie.insert(b"/", 9);
        assert_eq!(trie.matches(b"/anything/here"), vec![9]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut trie: Trie<u32> = Trie::new();
        assert!(trie.insert(b"/a", 1));
        assert!(!trie.insert(b"/a", 1));
        assert_eq!(trie.matches(b"/a"), vec![1]);
    }

    #[test]
    fn exact_beats_prefix_in_rpc_routing() {
        let mut trie: Trie<&'static str> = Trie::new();
        trie.insert(b"/api/foo", "exact");
        trie.insert(b"/api/foo/", "prefix");
        assert_eq!(trie.best_match(b"/api/foo"), Some(&"exact"));
        assert_eq!(trie.best_match(b"/api/foo/bar"), Some(&"prefix"));
    }

    #[test]
    fn remove_all_clears_every_pattern_for_a_client() {
        let mut trie: Trie<u32> = Trie::new();
        trie.insert(b"/a", 1);
        trie.insert(b"/b/", 1);
        trie.remove_all(&1);
        assert!(trie.matches(b"/a").is_empty());
        assert!(trie.matches(b"/b/x").is_empty());
    }
}
