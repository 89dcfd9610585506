//! Filter trie
//!
//! Filters are split on `/` and stored one level per node. Wildcard levels
//! are ordinary children keyed `+` and `#`, so a lookup visits at most three
//! children per topic level: the literal one, `+`, and `#`. Branches left
//! without a value are pruned on removal.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

const SINGLE: &str = "+";
const MULTI: &str = "#";

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    children: AHashMap<CompactString, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
        }
    }
}

impl<V> Node<V> {
    fn is_vacant(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn descend(&self, filter: &str) -> Option<&Node<V>> {
        filter
            .split('/')
            .try_fold(self, |node, level| node.children.get(level))
    }

    fn descend_mut(&mut self, filter: &str) -> Option<&mut Node<V>> {
        filter
            .split('/')
            .try_fold(self, |node, level| node.children.get_mut(level))
    }

    fn take(&mut self, levels: &[&str]) -> Option<V> {
        let Some((first, rest)) = levels.split_first() else {
            return self.value.take();
        };
        let child = self.children.get_mut(*first)?;
        let taken = child.take(rest);
        if child.is_vacant() {
            self.children.remove(*first);
        }
        taken
    }

    fn retain<F: FnMut(&mut V) -> bool>(&mut self, keep: &mut F) {
        if self.value.as_mut().is_some_and(|v| !keep(v)) {
            self.value = None;
        }
        self.children.retain(|_, child| {
            child.retain(keep);
            !child.is_vacant()
        });
    }

    fn visit<F: FnMut(&V)>(&self, visitor: &mut F) {
        if let Some(value) = &self.value {
            visitor(value);
        }
        for child in self.children.values() {
            child.visit(visitor);
        }
    }
}

/// Map from topic filter to `V`, searchable by topic name
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: Node<V>,
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self {
            root: Node::default(),
        }
    }
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Store `value` under `filter`, returning the value it replaced
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let node = filter.split('/').fold(&mut self.root, |node, level| {
            node.children.entry(CompactString::new(level)).or_default()
        });
        node.value.replace(value)
    }

    pub fn get(&self, filter: &str) -> Option<&V> {
        self.root.descend(filter)?.value.as_ref()
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        self.root.descend_mut(filter)?.value.as_mut()
    }

    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        self.root.take(&levels)
    }

    /// Keep only the values for which `keep` returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        self.root.retain(&mut keep);
    }

    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&V),
    {
        self.root.visit(&mut visitor);
    }

    /// Visit every value whose filter selects `topic`.
    ///
    /// A topic starting with `$` is not selected by a first-level wildcard.
    pub fn matches<F>(&self, topic: &str, mut visitor: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let shielded = topic.starts_with('$');

        let mut pending: SmallVec<[(&Node<V>, usize); 16]> = SmallVec::new();
        pending.push((&self.root, 0));

        while let Some((node, depth)) = pending.pop() {
            let wildcards = !(shielded && depth == 0);

            // '#' also selects the level above it
            if wildcards {
                if let Some(value) = node.children.get(MULTI).and_then(|n| n.value.as_ref()) {
                    visitor(value);
                }
            }

            let Some(level) = levels.get(depth) else {
                if let Some(value) = &node.value {
                    visitor(value);
                }
                continue;
            };

            if wildcards {
                if let Some(child) = node.children.get(SINGLE) {
                    pending.push((child, depth + 1));
                }
            }
            // a literal "+" or "#" level never appears in a valid topic name
            if let Some(child) = node.children.get(*level) {
                pending.push((child, depth + 1));
            }
        }
    }
}
