//! DHT network node: owns the UDP socket, routing table, token manager,
//! and the local store of announced peers, and dispatches KRPC traffic.
use super::krpc::{generate_transaction_id, ErrorCode, KrpcMessage, Query, Response, TransactionId};
use super::node::{Node, NodeId};
use super::routing_table::{NodeHealth, RoutingTable};
use super::token::TokenManager;
use super::{DhtError, DhtResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GetPeersResult {
    pub peers: Vec<SocketAddr>,
    pub nodes: Vec<Node>,
    pub token: Vec<u8>,
}

pub struct DhtServer {
    our_id: NodeId,
    socket: UdpSocket,
    routing_table: Mutex<RoutingTable>,
    tokens: Mutex<TokenManager>,
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<KrpcMessage>>>,
    announced_peers: Mutex<HashMap<[u8; 20], Vec<SocketAddr>>>,
}

impl DhtServer {
    pub async fn bind(our_id: NodeId, port: u16) -> DhtResult<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Arc::new(Self {
            our_id,
            socket,
            routing_table: Mutex::new(RoutingTable::new(our_id)),
            tokens: Mutex::new(TokenManager::new()),
            pending: Mutex::new(HashMap::new()),
            announced_peers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    pub async fn node_count(&self) -> usize {
        self.routing_table.lock().await.len()
    }

    pub async fn closest_known(&self, target: &NodeId, k: usize) -> Vec<Node> {
        self.routing_table.lock().await.closest_to(target, k)
    }

    /// Drives the receive loop until the socket errors. Each datagram is
    /// dispatched without blocking subsequent reads.
    pub async fn run(self: Arc<Self>) -> DhtResult<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let datagram = buf[..n].to_vec();
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_datagram(&datagram, from).await {
                    trace!(?from, error = %e, "dropping malformed DHT datagram");
                }
            });
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> DhtResult<()> {
        let message = KrpcMessage::decode(datagram)?;
        match message {
            KrpcMessage::Query { transaction_id, sender_id, query } => {
                self.note_node(sender_id, from).await;
                self.handle_query(transaction_id, sender_id, query, from).await
            }
            response_or_error => {
                let transaction_id = response_or_error.transaction_id().to_vec();
                if let Some(sender) = self.pending.lock().await.remove(&transaction_id) {
                    let _ = sender.send(response_or_error);
                }
                Ok(())
            }
        }
    }

    async fn note_node(&self, id: NodeId, addr: SocketAddr) {
        self.routing_table.lock().await.add_node(Node { id, addr }, NodeHealth::Good);
    }

    #[instrument(skip(self, query))]
    async fn handle_query(
        &self,
        transaction_id: TransactionId,
        sender_id: NodeId,
        query: Query,
        from: SocketAddr,
    ) -> DhtResult<()> {
        let response = match query {
            Query::Ping => KrpcMessage::Response { transaction_id, sender_id: self.our_id, response: Response::Ping },
            Query::FindNode { target } => {
                let nodes = self.routing_table.lock().await.closest_to(&target, super::BUCKET_SIZE);
                KrpcMessage::Response {
                    transaction_id,
                    sender_id: self.our_id,
                    response: Response::FindNode { nodes },
                }
            }
            Query::GetPeers { info_hash } => {
                let token = self.tokens.lock().await.issue(from.ip(), &info_hash);
                let known = self.announced_peers.lock().await.get(&info_hash).cloned().unwrap_or_default();
                let response = if known.is_empty() {
                    let nodes = self
                        .routing_table
                        .lock()
                        .await
                        .closest_to(&NodeId(info_hash), super::BUCKET_SIZE);
                    Response::GetPeersNodes { nodes, token }
                } else {
                    Response::GetPeersValues { peers: known, token }
                };
                KrpcMessage::Response { transaction_id, sender_id: self.our_id, response }
            }
            Query::AnnouncePeer { info_hash, port, token, implied_port } => {
                let valid = self.tokens.lock().await.verify(&token, from.ip(), &info_hash);
                if !valid {
                    KrpcMessage::Error {
                        transaction_id,
                        code: ErrorCode::Protocol,
                        message: "invalid token".into(),
                    }
                } else {
                    let announced_port = if implied_port { from.port() } else { port };
                    let addr = SocketAddr::new(from.ip(), announced_port);
                    self.announced_peers.lock().await.entry(info_hash).or_default().push(addr);
                    debug!(?addr, "recorded announce_peer");
                    KrpcMessage::Response { transaction_id, sender_id: self.our_id, response: Response::AnnouncePeer }
                }
            }
        };
        self.send(&response, from).await
    }

    async fn send(&self, message: &KrpcMessage, to: SocketAddr) -> DhtResult<()> {
        self.socket.send_to(&message.encode(), to).await?;
        Ok(())
    }

    /// Sends a query and waits for its matching response (or the 10 second
    /// query timeout), learning the addressed node on success.
    async fn query(&self, addr: SocketAddr, query: Query) -> DhtResult<(NodeId, Response)> {
        let transaction_id = generate_transaction_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(transaction_id.clone(), tx);

        let message = KrpcMessage::Query { transaction_id: transaction_id.clone(), sender_id: self.our_id, query };
        if let Err(e) = self.send(&message, addr).await {
            self.pending.lock().await.remove(&transaction_id);
            return Err(e);
        }

        match timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(KrpcMessage::Response { sender_id, response, .. })) => {
                self.note_node(sender_id, addr).await;
                Ok((sender_id, response))
            }
            Ok(Ok(KrpcMessage::Error { code, message, .. })) => {
                Err(DhtError::RemoteError { code: code as i64, message })
            }
            Ok(Ok(_)) => Err(DhtError::MalformedMessage("expected response or error".into())),
            Ok(Err(_)) => Err(DhtError::TransactionTimedOut),
            Err(_) => {
                self.pending.lock().await.remove(&transaction_id);
                Err(DhtError::TransactionTimedOut)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> DhtResult<NodeId> {
        let (id, _) = self.query(addr, Query::Ping).await?;
        Ok(id)
    }

    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> DhtResult<Vec<Node>> {
        let (_, response) = self.query(addr, Query::FindNode { target }).await?;
        match response {
            Response::FindNode { nodes } => Ok(nodes),
            _ => Err(DhtError::MalformedMessage("expected find_node response".into())),
        }
    }

    pub async fn get_peers(&self, addr: SocketAddr, info_hash: [u8; 20]) -> DhtResult<GetPeersResult> {
        let (_, response) = self.query(addr, Query::GetPeers { info_hash }).await?;
        Ok(match response {
            Response::GetPeersValues { peers, token } => GetPeersResult { peers, nodes: Vec::new(), token },
            Response::GetPeersNodes { nodes, token } => GetPeersResult { peers: Vec::new(), nodes, token },
            _ => return Err(DhtError::MalformedMessage("expected get_peers response".into())),
        })
    }

    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
    ) -> DhtResult<()> {
        let (_, response) =
            self.query(addr, Query::AnnouncePeer { info_hash, port, token, implied_port: false }).await?;
        match response {
            Response::AnnouncePeer => Ok(()),
            _ => Err(DhtError::MalformedMessage("expected announce_peer response".into())),
        }
    }

    /// Periodic maintenance: rotates the token secret and issues find_node
    /// refreshes for stale buckets. Callers drive this on a fixed interval.
    pub async fn run_maintenance_tick(self: &Arc<Self>) {
        self.tokens.lock().await.maybe_rotate();
        let stale = self.routing_table.lock().await.buckets_needing_refresh();
        for (_, target) in stale {
            let candidates = self.routing_table.lock().await.closest_to(&target, 1);
            for node in candidates {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.find_node(node.addr, target).await {
                        warn!(addr = %node.addr, error = %e, "bucket refresh find_node failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_round_trips_between_two_servers() {
        let a = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        let b_id = b.our_id();

        tokio::spawn(Arc::clone(&b).run());
        tokio::spawn(Arc::clone(&a).run());

        let responder_id = a.ping(b_addr).await.unwrap();
        assert_eq!(responder_id, b_id);
    }

    #[tokio::test]
    async fn get_peers_returns_nodes_when_no_peers_are_known() {
        let a = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        tokio::spawn(Arc::clone(&b).run());
        tokio::spawn(Arc::clone(&a).run());

        let result = a.get_peers(b_addr, [3u8; 20]).await.unwrap();
        assert!(result.peers.is_empty());
        assert!(!result.token.is_empty());
    }

    #[tokio::test]
    async fn announce_peer_then_get_peers_returns_the_announced_address() {
        let a = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        tokio::spawn(Arc::clone(&b).run());
        tokio::spawn(Arc::clone(&a).run());

        let info_hash = [4u8; 20];
        let first = a.get_peers(b_addr, info_hash).await.unwrap();
        a.announce_peer(b_addr, info_hash, 6881, first.token).await.unwrap();

        let second = a.get_peers(b_addr, info_hash).await.unwrap();
        assert_eq!(second.peers.len(), 1);
        assert_eq!(second.peers[0].port(), 6881);
    }

    #[tokio::test]
    async fn announce_peer_with_bad_token_is_rejected() {
        let a = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b = DhtServer::bind(NodeId::random(), 0).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        tokio::spawn(Arc::clone(&b).run());
        tokio::spawn(Arc::clone(&a).run());

        let err = a.announce_peer(b_addr, [5u8; 20], 6881, b"garbage!".to_vec()).await.unwrap_err();
        assert!(matches!(err, DhtError::RemoteError { .. }));
    }
}
