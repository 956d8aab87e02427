use std::slice::{Iter, IterMut};
use thiserror::Error;

use crate::id::NodeId;
use crate::routing::node::RoutingNode;

/// Default maximum number of nodes that should reside in any bucket.
pub const MAX_BUCKET_SIZE: usize = 8;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("bucket is full")]
    BucketFull,
    #[error("node is already in the bucket")]
    Duplicate,
    #[error("node is not in the bucket")]
    NotFound,
}

/// Bucket containing nodes at the same log-distance from the local node.
///
/// The bucket only knows its own capacity, not which distance it covers.
#[derive(Clone, Debug)]
pub struct Bucket {
    nodes: Vec<RoutingNode>,
    capacity: usize,
}

impl Bucket {
    pub fn new(capacity: usize) -> Bucket {
        Bucket {
            nodes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append the node. Fails if the bucket is full or already holds the node's id.
    pub fn add(&mut self, node: RoutingNode) -> Result<&mut RoutingNode, BucketError> {
        if !self.has_room(0) {
            return Err(BucketError::BucketFull);
        }

        if self.contains(&node.id()) {
            return Err(BucketError::Duplicate);
        }

        self.nodes.push(node);
        let index = self.nodes.len() - 1;

        Ok(&mut self.nodes[index])
    }

    pub fn remove(&mut self, id: &NodeId) -> Result<RoutingNode, BucketError> {
        let index = self.position(id).ok_or(BucketError::NotFound)?;
        Ok(self.nodes.remove(index))
    }

    pub fn get(&self, id: &NodeId) -> Result<&RoutingNode, BucketError> {
        self.nodes
            .iter()
            .find(|node| node.id() == *id)
            .ok_or(BucketError::NotFound)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Result<&mut RoutingNode, BucketError> {
        self.nodes
            .iter_mut()
            .find(|node| node.id() == *id)
            .ok_or(BucketError::NotFound)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Node seen least recently, `None` if the bucket is empty.
    pub fn stalest(&self) -> Option<&RoutingNode> {
        self.nodes.iter().min_by_key(|node| node.last_seen())
    }

    /// Node seen most recently, `None` if the bucket is empty.
    pub fn freshest(&self) -> Option<&RoutingNode> {
        self.nodes.iter().max_by_key(|node| node.last_seen())
    }

    /// Node with the most consecutive timeouts, the stalest one among equals.
    pub fn worst(&self) -> Option<&RoutingNode> {
        self.nodes.iter().reduce(|worst, node| {
            if node.consecutive_timeouts() > worst.consecutive_timeouts()
                || (node.consecutive_timeouts() == worst.consecutive_timeouts()
                    && node.last_seen() < worst.last_seen())
            {
                node
            } else {
                worst
            }
        })
    }

    /// Is there room for `reserve` more nodes on top of what the bucket holds?
    pub fn has_room(&self, reserve: usize) -> bool {
        self.nodes.len() + reserve <= self.capacity
    }

    /// Nodes in ascending round trip time. Nodes with unknown rtt come last.
    pub fn sorted_by_rtt(&self) -> Vec<&RoutingNode> {
        let mut nodes: Vec<_> = self.nodes.iter().collect();
        nodes.sort_by_key(|node| (node.rtt().is_none(), node.rtt()));
        nodes
    }

    pub fn iter(&self) -> Iter<RoutingNode> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<RoutingNode> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id() == *id)
    }
}

// ----------------------------------------------------------------------------//
