//! KRPC message framing: bencoded query/response/error dictionaries
//! carried over UDP.
use super::node::{Node, NodeId};
use super::{DhtError, DhtResult};
use crate::bencode::{encoder, BencodeValue};
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub type TransactionId = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: [u8; 20] },
    AnnouncePeer { info_hash: [u8; 20], port: u16, token: Vec<u8>, implied_port: bool },
}

impl Query {
    fn name(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping,
    FindNode { nodes: Vec<Node> },
    GetPeersNodes { nodes: Vec<Node>, token: Vec<u8> },
    GetPeersValues { peers: Vec<SocketAddr>, token: Vec<u8> },
    AnnouncePeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 201,
    Server = 202,
    Protocol = 203,
    MethodUnknown = 204,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcMessage {
    Query { transaction_id: TransactionId, sender_id: NodeId, query: Query },
    Response { transaction_id: TransactionId, sender_id: NodeId, response: Response },
    Error { transaction_id: TransactionId, code: ErrorCode, message: String },
}

fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        out.extend_from_slice(&node.id.0);
        if let SocketAddr::V4(v4) = node.addr {
            out.extend_from_slice(&v4.ip().octets());
            let mut port_buf = [0u8; 2];
            BigEndian::write_u16(&mut port_buf, v4.port());
            out.extend_from_slice(&port_buf);
        }
    }
    out
}

fn decode_compact_nodes(bytes: &[u8]) -> DhtResult<Vec<Node>> {
    if bytes.len() % 26 != 0 {
        return Err(DhtError::MalformedMessage("compact node list not a multiple of 26 bytes".into()));
    }
    Ok(bytes
        .chunks_exact(26)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[0..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = BigEndian::read_u16(&chunk[24..26]);
            Node { id: NodeId(id), addr: SocketAddr::V4(SocketAddrV4::new(ip, port)) }
        })
        .collect())
}

fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<BencodeValue> {
    peers
        .iter()
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => {
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&v4.ip().octets());
                let mut port_buf = [0u8; 2];
                BigEndian::write_u16(&mut port_buf, v4.port());
                buf.extend_from_slice(&port_buf);
                Some(BencodeValue::String(buf))
            }
            SocketAddr::V6(_) => None,
        })
        .collect()
}

fn decode_compact_peers(values: &[BencodeValue]) -> DhtResult<Vec<SocketAddr>> {
    values
        .iter()
        .map(|v| {
            let bytes = v
                .as_str_bytes()
                .ok_or_else(|| DhtError::MalformedMessage("values entry not a string".into()))?;
            if bytes.len() != 6 {
                return Err(DhtError::MalformedMessage("compact peer not 6 bytes".into()));
            }
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = BigEndian::read_u16(&bytes[4..6]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        })
        .collect()
}

fn dict_get<'a>(dict: &'a BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Option<&'a BencodeValue> {
    dict.get(key.as_bytes())
}

fn node_id_from(bytes: &[u8]) -> DhtResult<NodeId> {
    if bytes.len() != 20 {
        return Err(DhtError::MalformedMessage("node id not 20 bytes".into()));
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(bytes);
    Ok(NodeId(id))
}

fn info_hash_from(bytes: &[u8]) -> DhtResult<[u8; 20]> {
    if bytes.len() != 20 {
        return Err(DhtError::MalformedMessage("info_hash not 20 bytes".into()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl KrpcMessage {
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            KrpcMessage::Query { transaction_id, .. }
            | KrpcMessage::Response { transaction_id, .. }
            | KrpcMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut top = BTreeMap::new();
        top.insert(b"t".to_vec(), BencodeValue::String(self.transaction_id().to_vec()));

        match self {
            KrpcMessage::Query { sender_id, query, .. } => {
                top.insert(b"y".to_vec(), BencodeValue::String(b"q".to_vec()));
                top.insert(b"q".to_vec(), BencodeValue::String(query.name().as_bytes().to_vec()));
                let mut args = BTreeMap::new();
                args.insert(b"id".to_vec(), BencodeValue::String(sender_id.0.to_vec()));
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => {
                        args.insert(b"target".to_vec(), BencodeValue::String(target.0.to_vec()));
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(b"info_hash".to_vec(), BencodeValue::String(info_hash.to_vec()));
                    }
                    Query::AnnouncePeer { info_hash, port, token, implied_port } => {
                        args.insert(b"info_hash".to_vec(), BencodeValue::String(info_hash.to_vec()));
                        args.insert(b"port".to_vec(), BencodeValue::Integer(*port as i64));
                        args.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
                        args.insert(
                            b"implied_port".to_vec(),
                            BencodeValue::Integer(if *implied_port { 1 } else { 0 }),
                        );
                    }
                }
                top.insert(b"a".to_vec(), BencodeValue::Dict(args));
            }
            KrpcMessage::Response { sender_id, response, .. } => {
                top.insert(b"y".to_vec(), BencodeValue::String(b"r".to_vec()));
                let mut r = BTreeMap::new();
                r.insert(b"id".to_vec(), BencodeValue::String(sender_id.0.to_vec()));
                match response {
                    Response::Ping | Response::AnnouncePeer => {}
                    Response::FindNode { nodes } => {
                        r.insert(b"nodes".to_vec(), BencodeValue::String(encode_compact_nodes(nodes)));
                    }
                    Response::GetPeersNodes { nodes, token } => {
                        r.insert(b"nodes".to_vec(), BencodeValue::String(encode_compact_nodes(nodes)));
                        r.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
                    }
                    Response::GetPeersValues { peers, token } => {
                        r.insert(b"values".to_vec(), BencodeValue::List(encode_compact_peers(peers)));
                        r.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
                    }
                }
                top.insert(b"r".to_vec(), BencodeValue::Dict(r));
            }
            KrpcMessage::Error { code, message, .. } => {
                top.insert(b"y".to_vec(), BencodeValue::String(b"e".to_vec()));
                top.insert(
                    b"e".to_vec(),
                    BencodeValue::List(vec![
                        BencodeValue::Integer(*code as i64),
                        BencodeValue::String(message.as_bytes().to_vec()),
                    ]),
                );
            }
        }
        encoder::encode_to_vec(&BencodeValue::Dict(top))
    }

    pub fn decode(raw: &[u8]) -> DhtResult<Self> {
        let spanned = crate::bencode::decoder::decode(raw)?;
        let top = spanned.value.as_dict().ok_or_else(|| DhtError::MalformedMessage("not a dict".into()))?;
        let transaction_id = dict_get(top, "t")
            .and_then(|v| v.as_str_bytes())
            .ok_or_else(|| DhtError::MalformedMessage("missing t".into()))?
            .to_vec();
        let y = dict_get(top, "y")
            .and_then(|v| v.as_str_bytes())
            .ok_or_else(|| DhtError::MalformedMessage("missing y".into()))?;

        match y {
            b"q" => {
                let method = dict_get(top, "q")
                    .and_then(|v| v.as_str_bytes())
                    .ok_or_else(|| DhtError::MalformedMessage("missing q".into()))?;
                let args = dict_get(top, "a")
                    .and_then(|v| v.as_dict())
                    .ok_or_else(|| DhtError::MalformedMessage("missing a".into()))?;
                let sender_id = node_id_from(
                    dict_get(args, "id")
                        .and_then(|v| v.as_str_bytes())
                        .ok_or_else(|| DhtError::MalformedMessage("missing a.id".into()))?,
                )?;
                let query = match method {
                    b"ping" => Query::Ping,
                    b"find_node" => Query::FindNode {
                        target: node_id_from(
                            dict_get(args, "target")
                                .and_then(|v| v.as_str_bytes())
                                .ok_or_else(|| DhtError::MalformedMessage("missing target".into()))?,
                        )?,
                    },
                    b"get_peers" => Query::GetPeers {
                        info_hash: info_hash_from(
                            dict_get(args, "info_hash")
                                .and_then(|v| v.as_str_bytes())
                                .ok_or_else(|| DhtError::MalformedMessage("missing info_hash".into()))?,
                        )?,
                    },
                    b"announce_peer" => Query::AnnouncePeer {
                        info_hash: info_hash_from(
                            dict_get(args, "info_hash")
                                .and_then(|v| v.as_str_bytes())
                                .ok_or_else(|| DhtError::MalformedMessage("missing info_hash".into()))?,
                        )?,
                        port: dict_get(args, "port")
                            .and_then(|v| v.as_integer())
                            .ok_or_else(|| DhtError::MalformedMessage("missing port".into()))? as u16,
                        token: dict_get(args, "token")
                            .and_then(|v| v.as_str_bytes())
                            .ok_or_else(|| DhtError::MalformedMessage("missing token".into()))?
                            .to_vec(),
                        implied_port: dict_get(args, "implied_port").and_then(|v| v.as_integer()).unwrap_or(0) != 0,
                    },
                    other => {
                        return Err(DhtError::MalformedMessage(format!(
                            "unknown query method {:?}",
                            String::from_utf8_lossy(other)
                        )))
                    }
                };
                Ok(KrpcMessage::Query { transaction_id, sender_id, query })
            }
            b"r" => {
                let r = dict_get(top, "r")
                    .and_then(|v| v.as_dict())
                    .ok_or_else(|| DhtError::MalformedMessage("missing r".into()))?;
                let sender_id = node_id_from(
                    dict_get(r, "id")
                        .and_then(|v| v.as_str_bytes())
                        .ok_or_else(|| DhtError::MalformedMessage("missing r.id".into()))?,
                )?;
                let response = if let Some(values) = dict_get(r, "values").and_then(|v| v.as_list()) {
                    let token = dict_get(r, "token")
                        .and_then(|v| v.as_str_bytes())
                        .ok_or_else(|| DhtError::MalformedMessage("get_peers values response missing token".into()))?
                        .to_vec();
                    Response::GetPeersValues { peers: decode_compact_peers(values)?, token }
                } else if let Some(nodes) = dict_get(r, "nodes").and_then(|v| v.as_str_bytes()) {
                    let nodes = decode_compact_nodes(nodes)?;
                    match dict_get(r, "token").and_then(|v| v.as_str_bytes()) {
                        Some(token) => Response::GetPeersNodes { nodes, token: token.to_vec() },
                        None => Response::FindNode { nodes },
                    }
                } else {
                    Response::Ping
                };
                Ok(KrpcMessage::Response { transaction_id, sender_id, response })
            }
            b"e" => {
                let e = dict_get(top, "e")
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| DhtError::MalformedMessage("missing e".into()))?;
                let code = e
                    .first()
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| DhtError::MalformedMessage("error missing code".into()))?;
                let message = e
                    .get(1)
                    .and_then(|v| v.as_str_bytes())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                let code = match code {
                    201 => ErrorCode::Generic,
                    202 => ErrorCode::Server,
                    203 => ErrorCode::Protocol,
                    204 => ErrorCode::MethodUnknown,
                    _ => ErrorCode::Generic,
                };
                Ok(KrpcMessage::Error { transaction_id, code, message })
            }
            other => Err(DhtError::MalformedMessage(format!("unknown y value {:?}", String::from_utf8_lossy(other)))),
        }
    }
}

pub fn generate_transaction_id() -> TransactionId {
    use rand::Rng;
    let mut rng = rand::rng();
    vec![rng.random(), rng.random()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_round_trips() {
        let id = NodeId::random();
        let msg = KrpcMessage::Query { transaction_id: b"aa".to_vec(), sender_id: id, query: Query::Ping };
        let encoded = msg.encode();
        let decoded = KrpcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn find_node_response_round_trips_compact_nodes() {
        let sender = NodeId::random();
        let nodes = vec![
            Node { id: NodeId::random(), addr: "1.2.3.4:6881".parse().unwrap() },
            Node { id: NodeId::random(), addr: "5.6.7.8:51413".parse().unwrap() },
        ];
        let msg = KrpcMessage::Response {
            transaction_id: b"bb".to_vec(),
            sender_id: sender,
            response: Response::FindNode { nodes: nodes.clone() },
        };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        match decoded {
            KrpcMessage::Response { response: Response::FindNode { nodes: got }, .. } => assert_eq!(got, nodes),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn get_peers_values_response_round_trips() {
        let sender = NodeId::random();
        let peers = vec!["9.9.9.9:1000".parse().unwrap()];
        let msg = KrpcMessage::Response {
            transaction_id: b"cc".to_vec(),
            sender_id: sender,
            response: Response::GetPeersValues { peers: peers.clone(), token: b"tok1234".to_vec() },
        };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        match decoded {
            KrpcMessage::Response { response: Response::GetPeersValues { peers: got, token }, .. } => {
                assert_eq!(got, peers);
                assert_eq!(token, b"tok1234");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn announce_peer_query_round_trips() {
        let sender = NodeId::random();
        let msg = KrpcMessage::Query {
            transaction_id: b"dd".to_vec(),
            sender_id: sender,
            query: Query::AnnouncePeer {
                info_hash: [7u8; 20],
                port: 6881,
                token: b"xyz".to_vec(),
                implied_port: true,
            },
        };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn error_message_round_trips() {
        let msg = KrpcMessage::Error { transaction_id: b"ee".to_vec(), code: ErrorCode::Protocol, message: "bad token".into() };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn malformed_compact_node_list_is_rejected() {
        let mut top = BTreeMap::new();
        top.insert(b"t".to_vec(), BencodeValue::String(b"ff".to_vec()));
        top.insert(b"y".to_vec(), BencodeValue::String(b"r".to_vec()));
        let mut r = BTreeMap::new();
        r.insert(b"id".to_vec(), BencodeValue::String(vec![0u8; 20]));
        r.insert(b"nodes".to_vec(), BencodeValue::String(vec![0u8; 25]));
        top.insert(b"r".to_vec(), BencodeValue::Dict(r));
        let raw = encoder::encode_to_vec(&BencodeValue::Dict(top));
        assert!(KrpcMessage::decode(&raw).is_err());
    }
}
