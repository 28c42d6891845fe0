// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Consistent hash ring with virtual nodes.

use crate::ServerId;
use serde::{Deserialize, Serialize};
use digest::Digest;

/// Digest used to place nodes and keys on the ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5
    #[default]
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase hex digest of `data`.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(md5::Md5::digest(data)),
            HashAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(data)),
        }
    }
}

/// [`HashRing`] maps keys to nodes so that adding or removing a node only moves the keys of
/// that node.
///
/// Every node owns `replicas` positions at `hash("<node>:<i>")`. Positions are hex digests
/// compared lexicographically. A key belongs to the closest position at or below its own hash,
/// and keys below the first position wrap to the last one.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    algorithm: HashAlgorithm,
    positions: Vec<(String, ServerId)>,
    nodes: Vec<ServerId>,
}

impl HashRing {
    /// Returns an empty ring.
    pub fn new(replicas: usize, algorithm: HashAlgorithm) -> Self {
        Self {
            replicas: replicas.max(1),
            algorithm,
            positions: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Returns a ring holding `nodes`.
    pub fn with_nodes<I, S>(replicas: usize, algorithm: HashAlgorithm, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerId>,
    {
        let mut ring = Self::new(replicas, algorithm);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    /// Places a node on the ring. Adding a node twice has no effect.
    pub fn add_node(&mut self, node: impl Into<ServerId>) {
        let node = node.into();
        if self.nodes.contains(&node) {
            return;
        }
        for i in 0..self.replicas {
            let position = self.algorithm.hex_digest(format!("{node}:{i}").as_bytes());
            self.positions.push((position, node.clone()));
        }
        self.positions.sort();
        self.nodes.push(node);
    }

    /// Takes every position of a node off the ring.
    pub fn remove_node(&mut self, node: &str) {
        let Some(index) = self.nodes.iter().position(|n| n == node) else {
            return;
        };
        self.nodes.remove(index);
        self.positions.retain(|(_, n)| n != node);
    }

    /// Resolves a key to its node, or `None` for an empty ring.
    pub fn get_node(&self, key: &[u8]) -> Option<&ServerId> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = self.algorithm.hex_digest(key);
        let index = match self.positions.binary_search_by(|(position, _)| position.as_str().cmp(hash.as_str())) {
            Ok(i) => i,
            Err(0) => self.positions.len() - 1,
            Err(i) => i - 1,
        };
        Some(&self.positions[index].1)
    }

    /// Whether the node is on the ring.
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Nodes on the ring, in insertion order.
    pub fn nodes(&self) -> &[ServerId] {
        &self.nodes
    }

    /// Number of positions on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the ring holds no node.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn keys() -> Vec<String> {
        (0..1000).map(|i| format!("uid-{i}")).collect()
    }

    fn assign(ring: &HashRing) -> HashMap<String, ServerId> {
        keys().into_iter().map(|k| (k.clone(), ring.get_node(k.as_bytes()).unwrap().clone())).collect()
    }

    #[test]
    fn md5_hex_digest() {
        assert_eq!(HashAlgorithm::Md5.hex_digest(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(HashAlgorithm::Sha1.hex_digest(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn empty_ring_has_no_node() {
        let ring = HashRing::new(100, HashAlgorithm::Md5);
        assert_eq!(ring.get_node(b"anything"), None);
    }

    #[test]
    fn add_is_idempotent_and_remove_is_exact() {
        let mut ring = HashRing::with_nodes(100, HashAlgorithm::Md5, ["a", "b"]);
        ring.add_node("a");
        assert_eq!(ring.len(), 200);
        ring.remove_node("a");
        assert_eq!(ring.len(), 100);
        assert!(!ring.contains("a"));
        assert!(ring.positions.iter().all(|(_, n)| n == "b"));
        ring.remove_node("a");
        assert_eq!(ring.len(), 100);
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let mut ring = HashRing::with_nodes(100, HashAlgorithm::Md5, ["s1", "s2", "s3"]);
        let before = assign(&ring);
        ring.remove_node("s3");
        let after = assign(&ring);

        let mut moved = 0;
        for (key, node) in &before {
            let now = &after[key];
            assert_ne!(now, "s3");
            if node == "s3" {
                moved += 1;
            } else {
                assert_eq!(now, node, "key {key} moved although its node stayed");
            }
        }
        let share = moved as f64 / before.len() as f64;
        assert!((0.2..0.47).contains(&share), "moved share {share}");
    }

    #[test]
    fn adding_a_node_only_takes_keys_for_itself() {
        let mut ring = HashRing::with_nodes(100, HashAlgorithm::Sha256, ["s1", "s2"]);
        let before = assign(&ring);
        ring.add_node("s3");
        let after = assign(&ring);
        for (key, node) in &after {
            assert!(node == "s3" || node == &before[key]);
        }
    }
}
