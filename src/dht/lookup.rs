//! Iterative `find_node`/`get_peers` lookups: query the α closest
//! not-yet-queried nodes each round until the K closest known nodes have
//! all responded, no closer node appears, or the wall-clock budget expires.
use super::node::{Node, NodeId};
use super::server::DhtServer;
use super::{ALPHA, BUCKET_SIZE, LOOKUP_BUDGET_SECS};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const K: usize = BUCKET_SIZE;

struct ShortList {
    target: NodeId,
    by_distance: Vec<Node>,
    queried: HashSet<SocketAddr>,
    responded: HashSet<SocketAddr>,
}

impl ShortList {
    fn new(target: NodeId, seed: Vec<Node>) -> Self {
        let mut list = Self { target, by_distance: Vec::new(), queried: HashSet::new(), responded: HashSet::new() };
        for node in seed {
            list.insert(node);
        }
        list
    }

    fn insert(&mut self, node: Node) {
        if self.by_distance.iter().any(|n| n.id == node.id) {
            return;
        }
        self.by_distance.push(node);
        self.by_distance.sort_by_key(|n| self.target.distance(&n.id));
        self.by_distance.truncate(K.max(ALPHA * 4));
    }

    fn next_batch_to_query(&self) -> Vec<Node> {
        self.by_distance.iter().filter(|n| !self.queried.contains(&n.addr)).take(ALPHA).cloned().collect()
    }

    fn k_closest_all_responded(&self) -> bool {
        self.by_distance.iter().take(K).all(|n| self.responded.contains(&n.addr))
    }

    fn closest_distance(&self) -> Option<[u8; 20]> {
        self.by_distance.first().map(|n| self.target.distance(&n.id))
    }
}

/// Result of an iterative lookup: the closest nodes found, and (for
/// `get_peers`) the union of peer addresses reported anywhere along the way.
#[derive(Debug, Default)]
pub struct LookupResult {
    pub closest_nodes: Vec<Node>,
    pub peers: Vec<SocketAddr>,
}

#[instrument(skip(server, seed))]
pub async fn find_node(server: &Arc<DhtServer>, target: NodeId, seed: Vec<Node>) -> LookupResult {
    iterative(server, target, seed, None).await
}

#[instrument(skip(server, seed))]
pub async fn get_peers(server: &Arc<DhtServer>, info_hash: [u8; 20], seed: Vec<Node>) -> LookupResult {
    iterative(server, NodeId(info_hash), seed, Some(info_hash)).await
}

async fn iterative(
    server: &Arc<DhtServer>,
    target: NodeId,
    seed: Vec<Node>,
    info_hash: Option<[u8; 20]>,
) -> LookupResult {
    let deadline = Instant::now() + Duration::from_secs(LOOKUP_BUDGET_SECS);
    let mut short_list = ShortList::new(target, seed);
    let mut accumulated_peers: HashSet<SocketAddr> = HashSet::new();

    loop {
        if Instant::now() >= deadline {
            debug!("lookup hit its wall-clock budget");
            break;
        }
        if short_list.k_closest_all_responded() {
            break;
        }

        let batch = short_list.next_batch_to_query();
        if batch.is_empty() {
            break;
        }
        let closest_before = short_list.closest_distance();
        for node in &batch {
            short_list.queried.insert(node.addr);
        }

        let mut handles = Vec::new();
        for node in batch {
            let server = Arc::clone(server);
            handles.push(tokio::spawn(async move {
                let result = match info_hash {
                    Some(hash) => server.get_peers(node.addr, hash).await.map(|r| (r.nodes, r.peers)),
                    None => server.find_node(node.addr, target).await.map(|nodes| (nodes, Vec::new())),
                };
                (node, result)
            }));
        }

        for handle in handles {
            let Ok((node, result)) = handle.await else { continue };
            match result {
                Ok((nodes, peers)) => {
                    short_list.responded.insert(node.addr);
                    for n in nodes {
                        short_list.insert(n);
                    }
                    for peer in peers {
                        accumulated_peers.insert(peer);
                    }
                }
                Err(_) => continue,
            }
        }

        let closest_after = short_list.closest_distance();
        if closest_before.is_some() && closest_before == closest_after {
            // A full round produced no closer node; one more round is
            // allowed to drain remaining unqueried candidates, but if the
            // next batch is also empty we'll break above.
            if short_list.next_batch_to_query().is_empty() {
                break;
            }
        }
    }

    LookupResult {
        closest_nodes: short_list.by_distance.into_iter().take(K).collect(),
        peers: accumulated_peers.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, port: u16) -> Node {
        Node { id, addr: SocketAddr::new("127.0.0.1".parse().unwrap(), port) }
    }

    #[test]
    fn short_list_dedupes_by_node_id() {
        let target = NodeId::random();
        let id = NodeId::random();
        let mut list = ShortList::new(target, vec![node(id, 1)]);
        list.insert(node(id, 2));
        assert_eq!(list.by_distance.len(), 1);
        assert_eq!(list.by_distance[0].addr.port(), 1);
    }

    #[test]
    fn next_batch_excludes_already_queried_nodes() {
        let target = NodeId::random();
        let seed: Vec<Node> = (0..5).map(|i| node(NodeId::random(), i)).collect();
        let mut list = ShortList::new(target, seed.clone());
        list.queried.insert(seed[0].addr);
        let batch = list.next_batch_to_query();
        assert!(batch.iter().all(|n| n.addr != seed[0].addr));
        assert!(batch.len() <= ALPHA);
    }

    #[test]
    fn k_closest_all_responded_requires_every_top_k_entry() {
        let target = NodeId::random();
        let seed: Vec<Node> = (0..3).map(|i| node(NodeId::random(), i)).collect();
        let mut list = ShortList::new(target, seed.clone());
        assert!(!list.k_closest_all_responded());
        for n in &seed {
            list.responded.insert(n.addr);
        }
        assert!(list.k_closest_all_responded());
    }
}
