//! A longest-prefix-match tree.
//!
//! A binary trie indexed bit by bit from the most significant bit of the
//! prefix. Shorter prefixes sit closer to the root: inserting a prefix
//! that is shorter than the one stored at its position swaps the two and
//! sends the longer one further down. On any path from the root, prefix
//! lengths never decrease and every node's prefix is bit-compatible with
//! its ancestors, so a lookup can remember the last matching node while
//! descending and ends up with the longest match.
//!
//! All nodes of a tree live in an arena owned by the tree; child and
//! parent links are indices into that arena.

mod node;

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};

use inetnum::addr::Prefix;
use log::trace;

use crate::types::af::AddressFamily;

use node::{LpmNode, NodeArena, NodeIdx};

//------------ LpmMatch ------------------------------------------------------

/// One matched entry of an [`LpmTree`].
#[derive(Debug)]
pub struct LpmMatch<'a, AF: AddressFamily, T> {
    pub prefix: AF,
    pub len: u8,
    pub payload: &'a T,
}

//------------ LpmTree -------------------------------------------------------

/// A longest-prefix-match tree over one address family.
#[derive(Clone, Debug)]
pub struct LpmTree<AF: AddressFamily, T> {
    arena: NodeArena<AF, T>,
    root: Option<NodeIdx>,
}

impl<AF: AddressFamily, T> LpmTree<AF, T> {
    pub fn new() -> Self {
        Self {
            arena: NodeArena::new(),
            root: None,
        }
    }

    /// The number of prefixes in the tree.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Inserts a prefix, or replaces the payload of an existing one.
    ///
    /// Descends along the prefix's own bits. Wherever the new prefix is
    /// shorter than the one stored at the current position, the two
    /// change places and the longer one descends further, which keeps
    /// shorter prefixes closer to the root. Returns the previous payload
    /// if the exact prefix was already present.
    pub fn insert(
        &mut self,
        prefix: AF,
        len: u8,
        payload: T,
    ) -> Option<T> {
        let mut new_prefix = prefix.truncate_to_len(len);
        let mut new_len = len;
        let mut new_payload = payload;

        let mut cur = match self.root {
            Some(root) => root,
            None => {
                let idx = self.arena.alloc(LpmNode {
                    prefix: new_prefix,
                    len: new_len,
                    left: None,
                    right: None,
                    parent: None,
                    payload: new_payload,
                });
                self.root = Some(idx);
                return None;
            }
        };

        let mut level: u8 = 0;
        loop {
            {
                let node = self.arena.node_mut(cur);
                if new_len < node.len {
                    // The shorter prefix takes this position, the longer
                    // one descends in its stead.
                    trace!(
                        "re-rotating /{} below /{} at level {}",
                        node.len,
                        new_len,
                        level
                    );
                    mem::swap(&mut node.prefix, &mut new_prefix);
                    mem::swap(&mut node.len, &mut new_len);
                    mem::swap(&mut node.payload, &mut new_payload);
                }
                if node.prefix == new_prefix && node.len == new_len {
                    return Some(mem::replace(
                        &mut node.payload,
                        new_payload,
                    ));
                }
            }

            let bit = new_prefix.bit(level);
            match self.arena.node(cur).child(bit) {
                Some(idx) => {
                    cur = idx;
                    level += 1;
                }
                None => {
                    let idx = self.arena.alloc(LpmNode {
                        prefix: new_prefix,
                        len: new_len,
                        left: None,
                        right: None,
                        parent: Some(cur),
                        payload: new_payload,
                    });
                    self.arena.node_mut(cur).set_child(bit, Some(idx));
                    return None;
                }
            }
        }
    }

    /// Returns the entry with the longest prefix that covers the query.
    pub fn longest_match(
        &self,
        prefix: AF,
        len: u8,
    ) -> Option<LpmMatch<'_, AF, T>> {
        let query = prefix.truncate_to_len(len);
        let mut best = None;
        let mut cur = self.root;
        let mut level: u8 = 0;
        while let Some(idx) = cur {
            let node = self.arena.node(idx);
            if node.len <= len
                && node.prefix.matches_to_len(query, node.len)
            {
                // Lengths never decrease on the way down, so the last
                // match is the longest.
                best = Some(idx);
            }
            if level >= AF::BITS {
                break;
            }
            cur = node.child(query.bit(level));
            level += 1;
        }
        best.map(|idx| {
            let node = self.arena.node(idx);
            LpmMatch {
                prefix: node.prefix,
                len: node.len,
                payload: &node.payload,
            }
        })
    }

    /// Returns the payload of exactly this prefix, if present.
    pub fn exact_match(&self, prefix: AF, len: u8) -> Option<&T> {
        self.find_exact(prefix.truncate_to_len(len), len)
            .map(|idx| &self.arena.node(idx).payload)
    }

    pub fn exact_match_mut(
        &mut self,
        prefix: AF,
        len: u8,
    ) -> Option<&mut T> {
        let idx = self.find_exact(prefix.truncate_to_len(len), len)?;
        Some(&mut self.arena.node_mut(idx).payload)
    }

    /// Whether exactly this prefix is present and has no more-specific
    /// prefixes below it.
    pub fn is_leaf(&self, prefix: AF, len: u8) -> Option<bool> {
        self.find_exact(prefix.truncate_to_len(len), len)
            .map(|idx| self.arena.node(idx).is_leaf())
    }

    /// Removes a prefix and returns its payload.
    ///
    /// The removed content trickles down towards a leaf: at every step
    /// the child with the shorter prefix moves up into the vacated
    /// position, which keeps shorter prefixes on top. The leaf slot left
    /// over at the bottom is unlinked and recycled.
    pub fn remove(&mut self, prefix: AF, len: u8) -> Option<T> {
        let query = prefix.truncate_to_len(len);
        let mut cur = self.find_exact(query, len)?;

        loop {
            let (left, right) = {
                let node = self.arena.node(cur);
                (node.left, node.right)
            };
            let child = match (left, right) {
                (None, None) => break,
                (Some(child), None) | (None, Some(child)) => child,
                (Some(left), Some(right)) => {
                    if self.arena.node(left).len
                        <= self.arena.node(right).len
                    {
                        left
                    } else {
                        right
                    }
                }
            };
            self.arena.swap_content(cur, child);
            cur = child;
        }

        let node = self.arena.dealloc(cur);
        match node.parent {
            Some(parent) => {
                let parent_node = self.arena.node_mut(parent);
                if parent_node.left == Some(cur) {
                    parent_node.left = None;
                } else {
                    debug_assert_eq!(parent_node.right, Some(cur));
                    parent_node.right = None;
                }
            }
            None => self.root = None,
        }
        trace!("removed {:b}/{}", query, len);
        Some(node.payload)
    }

    /// Returns the entries below the given prefix's node, i.e. all its
    /// descendants in the tree, in pre-order. `None` if the prefix itself
    /// is not present.
    pub fn children_of(
        &self,
        prefix: AF,
        len: u8,
    ) -> Option<Vec<LpmMatch<'_, AF, T>>> {
        let idx = self.find_exact(prefix.truncate_to_len(len), len)?;
        let mut out = Vec::new();
        let node = self.arena.node(idx);
        if let Some(left) = node.left {
            self.collect_subtree(left, &mut out);
        }
        if let Some(right) = node.right {
            self.collect_subtree(right, &mut out);
        }
        Some(out)
    }

    /// Returns all entries of the tree in pre-order.
    pub fn entries(&self) -> Vec<LpmMatch<'_, AF, T>> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect_subtree(root, &mut out);
        }
        out
    }

    fn collect_subtree<'a>(
        &'a self,
        idx: NodeIdx,
        out: &mut Vec<LpmMatch<'a, AF, T>>,
    ) {
        let node = self.arena.node(idx);
        out.push(LpmMatch {
            prefix: node.prefix,
            len: node.len,
            payload: &node.payload,
        });
        if let Some(left) = node.left {
            self.collect_subtree(left, out);
        }
        if let Some(right) = node.right {
            self.collect_subtree(right, out);
        }
    }

    fn find_exact(&self, prefix: AF, len: u8) -> Option<NodeIdx> {
        let mut cur = self.root;
        let mut level: u8 = 0;
        while let Some(idx) = cur {
            let node = self.arena.node(idx);
            if node.prefix == prefix && node.len == len {
                return Some(idx);
            }
            if node.len > len || level >= AF::BITS {
                // Lengths never decrease on the way down; the key cannot
                // be below this node.
                break;
            }
            cur = node.child(prefix.bit(level));
            level += 1;
        }
        None
    }
}

impl<AF: AddressFamily, T> Default for LpmTree<AF, T> {
    fn default() -> Self {
        Self::new()
    }
}

//------------ PrefixLpm -----------------------------------------------------

/// A longest-prefix-match map keyed by [`Prefix`], both address families.
#[derive(Clone, Debug, Default)]
pub struct PrefixLpm<T> {
    v4: LpmTree<u32, T>,
    v6: LpmTree<u128, T>,
}

impl<T> PrefixLpm<T> {
    pub fn new() -> Self {
        Self {
            v4: LpmTree::new(),
            v6: LpmTree::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn insert(&mut self, prefix: Prefix, payload: T) -> Option<T> {
        match prefix.addr() {
            std::net::IpAddr::V4(addr) => self.v4.insert(
                u32::from(addr),
                prefix.len(),
                payload,
            ),
            std::net::IpAddr::V6(addr) => self.v6.insert(
                u128::from(addr),
                prefix.len(),
                payload,
            ),
        }
    }

    /// Returns the longest covering prefix and its payload.
    pub fn longest_match(
        &self,
        prefix: Prefix,
    ) -> Option<(Prefix, &T)> {
        match prefix.addr() {
            std::net::IpAddr::V4(addr) => {
                let found =
                    self.v4.longest_match(u32::from(addr), prefix.len())?;
                let prefix = Prefix::new(
                    Ipv4Addr::from(found.prefix).into(),
                    found.len,
                )
                .ok()?;
                Some((prefix, found.payload))
            }
            std::net::IpAddr::V6(addr) => {
                let found = self
                    .v6
                    .longest_match(u128::from(addr), prefix.len())?;
                let prefix = Prefix::new(
                    Ipv6Addr::from(found.prefix).into(),
                    found.len,
                )
                .ok()?;
                Some((prefix, found.payload))
            }
        }
    }

    pub fn exact_match(&self, prefix: Prefix) -> Option<&T> {
        match prefix.addr() {
            std::net::IpAddr::V4(addr) => {
                self.v4.exact_match(u32::from(addr), prefix.len())
            }
            std::net::IpAddr::V6(addr) => {
                self.v6.exact_match(u128::from(addr), prefix.len())
            }
        }
    }

    pub fn remove(&mut self, prefix: Prefix) -> Option<T> {
        match prefix.addr() {
            std::net::IpAddr::V4(addr) => {
                self.v4.remove(u32::from(addr), prefix.len())
            }
            std::net::IpAddr::V6(addr) => {
                self.v6.remove(u128::from(addr), prefix.len())
            }
        }
    }
}
