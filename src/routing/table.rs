use super::{
    bucket::{Bucket, BucketError},
    node::{NodeHandle, RoutingNode},
};
use crate::id::{NodeId, NUM_BUCKETS};
use crate::time::Instant;
use std::cmp::Reverse;

/// Routing table of the local node.
///
/// Two parallel arrays of buckets, `main` and `replacement`, indexed by
/// `log_distance(self, node) + 1`. Index 0 of `main` holds the local node and nothing else.
pub struct RoutingTable {
    local: NodeHandle,
    main: Vec<Bucket>,
    replacement: Vec<Bucket>,
    // Entries in `main`, the local node included.
    num_rnodes: usize,
    num_replacements: usize,
    // Lowest non-empty index of `main` above the self bucket, `NUM_BUCKETS` if there is none.
    lowest_nonempty_index: usize,
}

impl RoutingTable {
    /// Create a new RoutingTable holding only the local node.
    pub fn new(local: NodeHandle, bucket_size: usize, now: Instant) -> RoutingTable {
        let mut main: Vec<_> = (0..NUM_BUCKETS).map(|_| Bucket::new(bucket_size)).collect();
        let replacement = (0..NUM_BUCKETS).map(|_| Bucket::new(bucket_size)).collect();

        if main[0].add(RoutingNode::local(local, now)).is_err() {
            unreachable!("fresh self bucket rejected the local node")
        }

        RoutingTable {
            local,
            main,
            replacement,
            num_rnodes: 1,
            num_replacements: 0,
            lowest_nonempty_index: NUM_BUCKETS,
        }
    }

    /// Return the node id of the RoutingTable.
    pub fn node_id(&self) -> NodeId {
        self.local.id
    }

    pub fn local(&self) -> &NodeHandle {
        &self.local
    }

    /// Index of the bucket the given id belongs to.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        (self.local.id.log_distance(id) + 1) as usize
    }

    pub fn num_rnodes(&self) -> usize {
        self.num_rnodes
    }

    pub fn num_replacements(&self) -> usize {
        self.num_replacements
    }

    pub fn lowest_nonempty_index(&self) -> usize {
        self.lowest_nonempty_index
    }

    pub fn main_bucket(&self, index: usize) -> &Bucket {
        &self.main[index]
    }

    pub fn replacement_bucket(&self, index: usize) -> &Bucket {
        &self.replacement[index]
    }

    pub(crate) fn replacement_bucket_mut(&mut self, index: usize) -> &mut Bucket {
        &mut self.replacement[index]
    }

    /// Insert a node into `main`. A node already present in the matching replacement bucket is
    /// rejected as a duplicate: it has to be removed from there first.
    pub fn insert_main(&mut self, node: RoutingNode) -> Result<&mut RoutingNode, BucketError> {
        let index = self.bucket_index(&node.id());

        if self.replacement[index].contains(&node.id()) {
            return Err(BucketError::Duplicate);
        }

        let inserted = self.main[index].add(node)?;

        self.num_rnodes += 1;
        if index > 0 && index < self.lowest_nonempty_index {
            self.lowest_nonempty_index = index;
        }

        log::trace!("Inserted {:?} into main bucket {}", inserted.id(), index);

        Ok(inserted)
    }

    /// Insert a node into `replacement`. Rejected if the node already lives in `main`.
    pub fn insert_replacement(
        &mut self,
        node: RoutingNode,
    ) -> Result<&mut RoutingNode, BucketError> {
        let index = self.bucket_index(&node.id());

        if index == 0 || self.main[index].contains(&node.id()) {
            return Err(BucketError::Duplicate);
        }

        let inserted = self.replacement[index].add(node)?;
        self.num_replacements += 1;

        Ok(inserted)
    }

    /// Remove a node from whichever table holds it.
    ///
    /// # Panics
    ///
    /// Panics when asked to remove the local node.
    pub fn remove(&mut self, id: &NodeId) -> Result<RoutingNode, BucketError> {
        assert_ne!(*id, self.local.id, "attempt to remove the local node");

        let index = self.bucket_index(id);

        if let Ok(node) = self.main[index].remove(id) {
            self.num_rnodes -= 1;
            if index == self.lowest_nonempty_index && self.main[index].is_empty() {
                self.lowest_nonempty_index = (index + 1..NUM_BUCKETS)
                    .find(|index| !self.main[*index].is_empty())
                    .unwrap_or(NUM_BUCKETS);
            }

            return Ok(node);
        }

        let node = self.replacement[index].remove(id)?;
        self.num_replacements -= 1;

        Ok(node)
    }

    pub fn get_main(&self, id: &NodeId) -> Result<&RoutingNode, BucketError> {
        self.main[self.bucket_index(id)].get(id)
    }

    pub(crate) fn get_main_mut(&mut self, id: &NodeId) -> Result<&mut RoutingNode, BucketError> {
        let index = self.bucket_index(id);
        self.main[index].get_mut(id)
    }

    pub fn get_replacement(&self, id: &NodeId) -> Result<&RoutingNode, BucketError> {
        self.replacement[self.bucket_index(id)].get(id)
    }

    pub(crate) fn get_replacement_mut(
        &mut self,
        id: &NodeId,
    ) -> Result<&mut RoutingNode, BucketError> {
        let index = self.bucket_index(id);
        self.replacement[index].get_mut(id)
    }

    /// Does the main bucket the given id belongs to have room for it?
    pub fn has_room_main(&self, id: &NodeId) -> bool {
        self.main[self.bucket_index(id)].has_room(0)
    }

    /// Up to `k` nodes from `main` ordered by ascending XOR distance to `target`.
    ///
    /// Ties are broken by NS nodes first, then lower rtt, then more recently seen.
    pub fn closest(&self, target: &NodeId, k: usize, exclude_self: bool) -> Vec<RoutingNode> {
        if k == 0 {
            return Vec::new();
        }

        let target_index = self.bucket_index(target);
        let mut candidates: Vec<&RoutingNode> = Vec::with_capacity(k);

        // Nodes in the target's own bucket share more leading bits with the target than any
        // other node, so they come first.
        candidates.extend(self.main[target_index].iter());

        // Every bucket below the target's is exactly as far from the target as the local node
        // is, so they are taken together. Entirely empty prefixes are skipped.
        if candidates.len() < k && target_index > 0 {
            candidates.extend(self.main[0].iter());
            for bucket in self.main[self.lowest_nonempty_index.min(target_index)..target_index]
                .iter()
            {
                candidates.extend(bucket.iter());
            }
        }

        // Every bucket above the target's is strictly further away than the one before.
        let mut index = target_index + 1;
        while candidates.len() < k + 1 && index < NUM_BUCKETS {
            candidates.extend(self.main[index].iter());
            index += 1;
        }

        let local_id = self.local.id;
        let mut nodes: Vec<_> = candidates
            .into_iter()
            .filter(|node| !exclude_self || node.id() != local_id)
            .collect();

        nodes.sort_by_key(|node| {
            (
                node.id() ^ *target,
                Reverse(node.is_ns()),
                node.rtt().is_none(),
                node.rtt(),
                Reverse(node.last_seen()),
            )
        });

        nodes.into_iter().take(k).cloned().collect()
    }

    /// Every node of `main`, the local node included.
    pub fn all_main(&self) -> Vec<RoutingNode> {
        self.main.iter().flat_map(Bucket::iter).cloned().collect()
    }

    pub fn all_replacement(&self) -> Vec<RoutingNode> {
        self.replacement
            .iter()
            .flat_map(Bucket::iter)
            .cloned()
            .collect()
    }
}

// ----------------------------------------------------------------------------//
