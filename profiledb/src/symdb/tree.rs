// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack trace prefix trees.
//!
//! Nodes live in an arena and point at each other by index. Node 0 is the
//! root sentinel (parent -1); every other node's parent has a lower index.
//! The index of the node reached by the leaf frame is the stack trace id.

use crate::error::{Error, Result};
use profiledb_protobuf::varint;
use std::io::{self, Write};

const NONE: i32 = -1;
/// Node indices are stored as `i32`.
const MAX_NODES: usize = i32::MAX as usize;

#[derive(Copy, Clone, Debug)]
struct Node {
    parent: i32,
    location: u64,
    first_child: i32,
    next_sibling: i32,
}

#[derive(Clone, Debug)]
pub struct StacktraceTree {
    nodes: Vec<Node>,
    max_nodes: usize,
}

impl Default for StacktraceTree {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl StacktraceTree {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity.max(1));
        nodes.push(Node {
            parent: NONE,
            location: 0,
            first_child: NONE,
            next_sibling: NONE,
        });
        Self {
            nodes,
            max_nodes: MAX_NODES,
        }
    }

    #[cfg(test)]
    fn with_max_nodes(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            ..Self::default()
        }
    }

    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Inserts `locations` (leaf first) and returns the id of the leaf node.
    /// Inserting the same sequence again returns the same id.
    ///
    /// Fails with [`Error::CapacityExceeded`] once the tree would need more
    /// nodes than an `i32` index can address; the tree is left unchanged.
    pub fn insert(&mut self, locations: &[u64]) -> Result<u32> {
        let (mut current, depth) = self.find_prefix(locations);
        let missing = &locations[..locations.len() - depth];
        if self.nodes.len() + missing.len() > self.max_nodes {
            return Err(Error::CapacityExceeded("stack trace tree"));
        }
        for &location in missing.iter().rev() {
            let id = i32::try_from(self.nodes.len())
                .map_err(|_| Error::CapacityExceeded("stack trace tree"))?;
            let parent = &mut self.nodes[current];
            let next_sibling = parent.first_child;
            parent.first_child = id;
            self.nodes.push(Node {
                parent: current as i32,
                location,
                first_child: NONE,
                next_sibling,
            });
            current = id as usize;
        }
        u32::try_from(current).map_err(|_| Error::CapacityExceeded("stack trace tree"))
    }

    /// Walks the longest stored prefix of `locations` from the root. Returns
    /// the deepest node reached and the number of frames it covers.
    fn find_prefix(&self, locations: &[u64]) -> (usize, usize) {
        let mut current = 0usize;
        for (depth, &location) in locations.iter().rev().enumerate() {
            let mut child = self.nodes[current].first_child;
            while child >= 0 && self.nodes[child as usize].location != location {
                child = self.nodes[child as usize].next_sibling;
            }
            if child < 0 {
                return (current, depth);
            }
            current = child as usize;
        }
        (current, locations.len())
    }

    /// Writes the locations of `id`, leaf first, into `dst`. Returns false if
    /// the id is out of range.
    pub fn resolve(&self, id: u32, dst: &mut Vec<u64>) -> bool {
        resolve(&self.nodes, id, dst, |n| (n.parent, n.location))
    }

    /// Encodes every node as `uvarint(zigzag(parent - previous parent))`
    /// followed by `uvarint(location)`.
    pub fn write_to<W: Write>(&self, dst: &mut W) -> io::Result<u64> {
        let mut written = 0u64;
        let mut prev = 0i64;
        let mut buf = [0u8; 2 * varint::MAX_LEN];
        for node in &self.nodes {
            let parent = i64::from(node.parent);
            let delta = varint::zigzag_encode(parent - prev);
            let mut n = varint::put_uvarint(&mut buf, delta).unwrap_or_default();
            n += varint::put_uvarint(&mut buf[n..], node.location).unwrap_or_default();
            dst.write_all(&buf[..n])?;
            written += n as u64;
            prev = parent;
        }
        Ok(written)
    }
}

fn resolve<N>(nodes: &[N], id: u32, dst: &mut Vec<u64>, get: impl Fn(&N) -> (i32, u64)) -> bool {
    dst.clear();
    let Some(mut node) = nodes.get(id as usize) else {
        return false;
    };
    loop {
        let (parent, location) = get(node);
        if parent < 0 {
            return true;
        }
        dst.push(location);
        match nodes.get(parent as usize) {
            Some(p) => node = p,
            None => return false,
        }
    }
}

/// The decoded, read-only form of a tree: parent pointers only.
#[derive(Clone, Debug, Default)]
pub struct ParentPointerTree {
    nodes: Vec<(i32, u64)>,
}

impl ParentPointerTree {
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut nodes = Vec::new();
        let mut prev = 0i64;
        while !bytes.is_empty() {
            let (delta, n) = varint::decode_uvarint(bytes).ok_or(Error::InvalidSize)?;
            bytes = &bytes[n..];
            let (location, n) = varint::decode_uvarint(bytes).ok_or(Error::InvalidSize)?;
            bytes = &bytes[n..];
            let parent = prev + varint::zigzag_decode(delta);
            if parent < -1 || parent >= nodes.len() as i64 {
                return Err(Error::invalid_input(
                    "stack trace tree parent pointers must point backwards",
                ));
            }
            nodes.push((parent as i32, location));
            prev = parent;
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn resolve(&self, id: u32, dst: &mut Vec<u64>) -> bool {
        resolve(&self.nodes, id, dst, |&(parent, location)| (parent, location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn shares_prefixes() {
        let mut tree = StacktraceTree::default();
        let ids: Vec<u32> = [
            &[3, 2, 1][..],
            &[2, 1],
            &[4, 3, 2, 1],
            &[3, 1],
            &[5, 3, 2, 1],
        ]
        .iter()
        .map(|s| tree.insert(s).unwrap())
        .collect();
        assert_eq!(ids, [3, 2, 4, 5, 6]);
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.insert(&[3, 1]).unwrap(), 5);
        assert_eq!(tree.insert(&[]).unwrap(), 0);

        let mut dst = Vec::new();
        assert!(tree.resolve(6, &mut dst));
        assert_eq!(dst, [5, 3, 2, 1]);
        assert!(tree.resolve(0, &mut dst));
        assert!(dst.is_empty());
        assert!(!tree.resolve(7, &mut dst));
    }

    #[test]
    fn full_tree_rejects_new_nodes() {
        let mut tree = StacktraceTree::with_max_nodes(4);
        assert_eq!(tree.insert(&[2, 1]).unwrap(), 2);
        // Needs two more nodes, only one is left.
        assert!(matches!(
            tree.insert(&[4, 3]),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(tree.len(), 3);
        // Known prefixes and a single new node still fit.
        assert_eq!(tree.insert(&[2, 1]).unwrap(), 2);
        assert_eq!(tree.insert(&[3, 2, 1]).unwrap(), 3);
        assert!(tree.insert(&[5]).is_err());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn encoding_starts_with_root() {
        let mut tree = StacktraceTree::default();
        tree.insert(&[2, 1]).unwrap();
        let mut out = Vec::new();
        let n = tree.write_to(&mut out).unwrap();
        // root: zigzag(-1 - 0) = 1, location 0
        // node 1: zigzag(0 - -1) = 2, location 1
        // node 2: zigzag(1 - 0) = 2, location 2
        assert_eq!(out, [1, 0, 2, 1, 2, 2]);
        assert_eq!(n, 6);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ParentPointerTree::decode(&[0x80]),
            Err(Error::InvalidSize)
        ));
        // Parent pointer of the first node points forward.
        assert!(ParentPointerTree::decode(&[2, 0]).is_err());
        assert!(ParentPointerTree::decode(&[]).unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            ..ProptestConfig::default()
        })]

        #[test]
        fn resolution_round_trip(stacks in proptest::collection::vec(
            proptest::collection::vec(1u64..8, 0..12), 1..32)
        ) {
            let mut tree = StacktraceTree::default();
            let ids: Vec<u32> = stacks.iter().map(|s| tree.insert(s).unwrap()).collect();

            let mut encoded = Vec::new();
            tree.write_to(&mut encoded).unwrap();
            let decoded = ParentPointerTree::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.len(), tree.len());

            let mut dst = Vec::new();
            for (id, stack) in ids.iter().zip(&stacks) {
                prop_assert!(tree.resolve(*id, &mut dst));
                prop_assert_eq!(&dst, stack);
                prop_assert!(decoded.resolve(*id, &mut dst));
                prop_assert_eq!(&dst, stack);
            }
        }
    }
}
