//! Copy-on-write B+ tree for boxdb
//!
//! This module implements an in-memory B+ tree whose nodes are shared through
//! `Arc`. Cloning a tree is O(1); a mutation copies only the nodes on the path
//! from the root to the changed leaf (`Arc::make_mut`), so a snapshot taken
//! before the mutation keeps seeing the old contents.
//!
//! Internal nodes follow the rule that `keys[i]` is no greater than every key
//! in `children[i + 1]` and greater than every key in `children[i]`.

use std::borrow::Borrow;
use std::ops::Bound;
use std::sync::Arc;

const ORDER: usize = 32;

#[derive(Debug, Clone)]
enum Node<K, V> {
    /// Internal node with separator keys and child pointers
    Internal {
        keys: Vec<K>,
        children: Vec<Arc<Node<K, V>>>,
    },
    /// Leaf node with sorted keys and their values
    Leaf { keys: Vec<K>, values: Vec<V> },
}

impl<K, V> Node<K, V> {
    fn is_empty(&self) -> bool {
        match self {
            Node::Internal { children, .. } => children.is_empty(),
            Node::Leaf { keys, .. } => keys.is_empty(),
        }
    }
}

type Split<K, V> = Option<(Arc<Node<K, V>>, K)>;

/// Persistent B+ tree map
#[derive(Debug, Clone)]
pub struct CowBTree<K, V> {
    root: Option<Arc<Node<K, V>>>,
    size: usize,
}

impl<K, V> Default for CowBTree<K, V> {
    fn default() -> Self {
        Self { root: None, size: 0 }
    }
}

fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    match keys.binary_search(key) {
        Ok(p) => p + 1,
        Err(p) => p,
    }
}

impl<K: Ord + Clone, V: Clone> CowBTree<K, V> {
    /// Create a new empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the tree
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Insert a key-value pair, returning the previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let Some(root) = self.root.as_mut() else {
            self.root = Some(Arc::new(Node::Leaf {
                keys: vec![key],
                values: vec![value],
            }));
            self.size = 1;
            return None;
        };

        let (replaced, split) = Self::insert_recursive(Arc::make_mut(root), key, value);
        if let Some((new_node, mid_key)) = split {
            // Root split, create new root
            let old_root = root.clone();
            *root = Arc::new(Node::Internal {
                keys: vec![mid_key],
                children: vec![old_root, new_node],
            });
        }
        if replaced.is_none() {
            self.size += 1;
        }
        replaced
    }

    fn insert_recursive(node: &mut Node<K, V>, key: K, value: V) -> (Option<V>, Split<K, V>) {
        match node {
            Node::Leaf { keys, values } => {
                let pos = match keys.binary_search(&key) {
                    Ok(pos) => return (Some(std::mem::replace(&mut values[pos], value)), None),
                    Err(pos) => pos,
                };
                keys.insert(pos, key);
                values.insert(pos, value);

                if keys.len() > ORDER {
                    let mid = keys.len() / 2;
                    let new_keys = keys.split_off(mid);
                    let new_values = values.split_off(mid);
                    let mid_key = new_keys[0].clone();
                    let right = Node::Leaf {
                        keys: new_keys,
                        values: new_values,
                    };
                    return (None, Some((Arc::new(right), mid_key)));
                }
                (None, None)
            }
            Node::Internal { keys, children } => {
                let pos = child_index(keys, &key);
                let (replaced, split) =
                    Self::insert_recursive(Arc::make_mut(&mut children[pos]), key, value);
                if let Some((new_node, mid_key)) = split {
                    keys.insert(pos, mid_key);
                    children.insert(pos + 1, new_node);

                    if keys.len() > ORDER {
                        let mid = keys.len() / 2;
                        let mid_key = keys[mid].clone();
                        let new_keys = keys.split_off(mid + 1);
                        keys.pop(); // Remove mid_key from left node
                        let new_children = children.split_off(mid + 1);
                        let right = Node::Internal {
                            keys: new_keys,
                            children: new_children,
                        };
                        return (replaced, Some((Arc::new(right), mid_key)));
                    }
                }
                (replaced, None)
            }
        }
    }

    /// Search for a key in the tree
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut curr = self.root.as_deref()?;
        loop {
            match curr {
                Node::Leaf { keys, values } => {
                    return keys
                        .binary_search_by(|k| k.borrow().cmp(key))
                        .ok()
                        .map(|pos| &values[pos]);
                }
                Node::Internal { keys, children } => {
                    let pos = match keys.binary_search_by(|k| k.borrow().cmp(key)) {
                        Ok(p) => p + 1,
                        Err(p) => p,
                    };
                    curr = &children[pos];
                }
            }
        }
    }

    /// Check whether a key is present
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Delete a key, returning its value.
    ///
    /// Empty nodes are unlinked and a root with a single child is collapsed;
    /// underfull nodes are not merged.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        // Probe first so an absent key copies no nodes.
        if !self
            .root
            .as_deref()
            .map_or(false, |root| Self::subtree_contains(root, key))
        {
            return None;
        }
        let root = self.root.as_mut()?;
        let removed = Self::remove_recursive(Arc::make_mut(root), key)?;
        self.size -= 1;

        loop {
            let next = match self.root.as_deref() {
                Some(node) if node.is_empty() => None,
                Some(Node::Internal { children, .. }) if children.len() == 1 => {
                    Some(children[0].clone())
                }
                _ => break,
            };
            self.root = next;
        }
        Some(removed)
    }

    fn remove_recursive(node: &mut Node<K, V>, key: &K) -> Option<V> {
        match node {
            Node::Leaf { keys, values } => {
                let pos = keys.binary_search(key).ok()?;
                keys.remove(pos);
                Some(values.remove(pos))
            }
            Node::Internal { keys, children } => {
                let pos = child_index(keys, key);
                let child = Arc::make_mut(&mut children[pos]);
                let removed = Self::remove_recursive(child, key);
                if child.is_empty() {
                    children.remove(pos);
                    if !keys.is_empty() {
                        keys.remove(pos.saturating_sub(1));
                    }
                }
                removed
            }
        }
    }

    fn subtree_contains(node: &Node<K, V>, key: &K) -> bool {
        match node {
            Node::Leaf { keys, .. } => keys.binary_search(key).is_ok(),
            Node::Internal { keys, children } => {
                Self::subtree_contains(&children[child_index(keys, key)], key)
            }
        }
    }

    /// Iterate over entries with keys within the bounds, in key order
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Range<'_, K, V> {
        let mut stack = Vec::new();
        let mut curr = self.root.as_deref();
        while let Some(node) = curr {
            match node {
                Node::Internal { keys, children } => {
                    let pos = match lower {
                        Bound::Unbounded => 0,
                        Bound::Included(k) | Bound::Excluded(k) => child_index(keys, k),
                    };
                    stack.push((node, pos + 1));
                    curr = Some(children[pos].as_ref());
                }
                Node::Leaf { keys, .. } => {
                    let pos = match lower {
                        Bound::Unbounded => 0,
                        Bound::Included(k) => keys.partition_point(|x| x < k),
                        Bound::Excluded(k) => keys.partition_point(|x| x <= k),
                    };
                    stack.push((node, pos));
                    curr = None;
                }
            }
        }
        Range {
            stack,
            upper: upper.cloned(),
        }
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> Range<'_, K, V> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// First entry at or after the lower bound
    pub fn first_from(&self, lower: Bound<&K>) -> Option<(K, V)> {
        self.range(lower, Bound::Unbounded)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Check whether two trees share the same root node
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for CowBTree<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tree = Self::new();
        for (k, v) in iter {
            tree.insert(k, v);
        }
        tree
    }
}

/// Ordered iterator over a key range
pub struct Range<'a, K, V> {
    /// (node, next position) from the root down
    stack: Vec<(&'a Node<K, V>, usize)>,
    upper: Bound<K>,
}

impl<'a, K: Ord, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let node: &'a Node<K, V> = frame.0;
            let idx = frame.1;
            frame.1 += 1;

            match node {
                Node::Leaf { keys, values } => {
                    if idx < keys.len() {
                        let key = &keys[idx];
                        let within = match &self.upper {
                            Bound::Unbounded => true,
                            Bound::Included(u) => key <= u,
                            Bound::Excluded(u) => key < u,
                        };
                        if !within {
                            self.stack.clear();
                            return None;
                        }
                        return Some((key, &values[idx]));
                    }
                    self.stack.pop();
                }
                Node::Internal { children, .. } => {
                    if idx < children.len() {
                        self.stack.push((children[idx].as_ref(), 0));
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}
