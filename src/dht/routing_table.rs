//! The bucketed routing table: 160 k-buckets of at most `BUCKET_SIZE`
//! entries each, ordered least- to most-recently-seen.
use super::node::{Node, NodeId};
use super::{BUCKET_REFRESH_INTERVAL_SECS, BUCKET_SIZE, ID_BITS};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    health: NodeHealth,
}

struct Bucket {
    entries: Vec<Entry>,
    last_touched: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self { entries: Vec::new(), last_touched: Instant::now() }
    }
}

pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self { our_id, buckets: (0..ID_BITS).map(|_| Bucket::new()).collect() }
    }

    /// Adds or refreshes a node, per the routing-table contract:
    /// 1. Drop self-ids and BAD nodes.
    /// 2. If present, move to the tail (most-recently-seen).
    /// 3. Else if the bucket isn't full, append.
    /// 4. Else replace a BAD node, then a QUESTIONABLE one; otherwise drop.
    pub fn add_node(&mut self, node: Node, health: NodeHealth) {
        if node.id == self.our_id || matches!(health, NodeHealth::Bad) {
            return;
        }
        let Some(bucket_index) = self.our_id.bucket_index(&node.id) else {
            return;
        };
        let bucket = &mut self.buckets[bucket_index];
        bucket.last_touched = Instant::now();

        if let Some(pos) = bucket.entries.iter().position(|e| e.node.id == node.id) {
            let mut entry = bucket.entries.remove(pos);
            entry.node = node;
            entry.health = health;
            bucket.entries.push(entry);
            return;
        }

        if bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push(Entry { node, health });
            return;
        }

        if let Some(pos) = bucket.entries.iter().position(|e| e.health == NodeHealth::Bad) {
            bucket.entries[pos] = Entry { node, health };
            return;
        }
        if let Some(pos) = bucket.entries.iter().position(|e| e.health == NodeHealth::Questionable) {
            bucket.entries[pos] = Entry { node, health };
        }
        // Otherwise the bucket is full of GOOD nodes: discard the newcomer.
    }

    pub fn mark_health(&mut self, id: &NodeId, health: NodeHealth) {
        if let Some(bucket_index) = self.our_id.bucket_index(id) {
            if let Some(entry) = self.buckets[bucket_index].entries.iter_mut().find(|e| e.node.id == *id) {
                entry.health = health;
            }
        }
    }

    /// The `k` nodes (across all buckets) closest to `target` by XOR
    /// distance.
    pub fn closest_to(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut all: Vec<Node> = self.buckets.iter().flat_map(|b| b.entries.iter().map(|e| e.node)).collect();
        all.sort_by_key(|n| target.distance(&n.id));
        all.truncate(k);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buckets untouched for longer than the refresh interval, each paired
    /// with a random id falling in its range — callers issue `find_node`
    /// for each.
    pub fn buckets_needing_refresh(&self) -> Vec<(usize, NodeId)> {
        let limit = Duration::from_secs(BUCKET_REFRESH_INTERVAL_SECS);
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && now.duration_since(b.last_touched) > limit)
            .map(|(i, _)| (i, self.our_id.random_in_bucket(i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(id: NodeId) -> Node {
        Node { id, addr: "127.0.0.1:6881".parse::<SocketAddr>().unwrap() }
    }

    #[test]
    fn self_id_is_never_added() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        table.add_node(node(our_id), NodeHealth::Good);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn full_bucket_of_good_nodes_rejects_newcomer() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        // All of these fall in the same bucket (159, the farthest) by
        // sharing our_id's top bit flipped and randomizing the rest.
        let mut ids = Vec::new();
        for _ in 0..BUCKET_SIZE + 2 {
            ids.push(our_id.random_in_bucket(159));
        }
        for id in &ids {
            table.add_node(node(*id), NodeHealth::Good);
        }
        let bucket_index = our_id.bucket_index(&ids[0]).unwrap();
        let bucket_count = table
            .closest_to(&our_id, usize::MAX)
            .into_iter()
            .filter(|n| our_id.bucket_index(&n.id) == Some(bucket_index))
            .count();
        assert_eq!(bucket_count, BUCKET_SIZE);
    }

    #[test]
    fn bad_node_is_replaced_when_bucket_is_full() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        let mut ids = Vec::new();
        for _ in 0..BUCKET_SIZE {
            ids.push(our_id.random_in_bucket(100));
        }
        for id in &ids {
            table.add_node(node(*id), NodeHealth::Good);
        }
        table.mark_health(&ids[0], NodeHealth::Bad);
        let newcomer = our_id.random_in_bucket(100);
        table.add_node(node(newcomer), NodeHealth::Good);

        let present: Vec<NodeId> =
            table.closest_to(&our_id, usize::MAX).into_iter().map(|n| n.id).collect();
        assert!(!present.contains(&ids[0]));
        assert!(present.contains(&newcomer));
    }

    #[test]
    fn closest_to_orders_by_xor_distance() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        for index in [10, 50, 159] {
            table.add_node(node(our_id.random_in_bucket(index)), NodeHealth::Good);
        }
        let closest = table.closest_to(&our_id, 1);
        assert_eq!(closest.len(), 1);
        // The lowest bucket index (10) is the smallest distance.
        assert_eq!(our_id.bucket_index(&closest[0].id), Some(10));
    }
}
