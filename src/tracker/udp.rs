//! UDP tracker client (BEP 15): a two-step connect/announce state machine.
use super::{AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

const PROTOCOL_ID: u64 = 0x0000_0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 4;

/// A connection id is valid for this long before a fresh connect exchange
/// is required.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub struct UdpTrackerClient {
    socket: UdpSocket,
    cached_connection: Option<(u64, Instant)>,
}

impl UdpTrackerClient {
    /// Binds an ephemeral local UDP socket and connects it to `tracker_addr`
    /// so subsequent `send`/`recv` calls implicitly target that peer.
    pub async fn connect_socket(tracker_addr: SocketAddr) -> TrackerResult<Self> {
        let local_addr: SocketAddr = if tracker_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(tracker_addr).await?;
        Ok(Self { socket, cached_connection: None })
    }

    async fn transact(&self, request: &[u8]) -> TrackerResult<Vec<u8>> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            self.socket.send(request).await?;
            let mut buf = vec![0u8; 1024];
            match timeout(TRANSACTION_TIMEOUT, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => last_err = Some(TrackerError::Io(e)),
                Err(_) => {
                    warn!(attempt, "UDP tracker transaction timed out, retrying");
                    last_err = Some(TrackerError::TransactionTimedOut(attempt));
                }
            }
        }
        Err(last_err.unwrap_or(TrackerError::TransactionTimedOut(MAX_RETRIES)))
    }

    /// Performs the connect exchange, caching the resulting connection id
    /// for up to a minute.
    #[instrument(skip(self))]
    async fn ensure_connected(&mut self) -> TrackerResult<u64> {
        if let Some((id, obtained_at)) = self.cached_connection {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::rng().random();
        let mut request = [0u8; 16];
        BigEndian::write_u64(&mut request[0..8], PROTOCOL_ID);
        BigEndian::write_u32(&mut request[8..12], ACTION_CONNECT);
        BigEndian::write_u32(&mut request[12..16], transaction_id);

        let response = self.transact(&request).await?;
        if response.len() < 16 {
            return Err(TrackerError::InvalidResponse("connect response too short".to_string()));
        }
        let action = BigEndian::read_u32(&response[0..4]);
        let resp_transaction_id = BigEndian::read_u32(&response[4..8]);
        if action != ACTION_CONNECT || resp_transaction_id != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "connect response action/transaction id mismatch".to_string(),
            ));
        }
        let connection_id = BigEndian::read_u64(&response[8..16]);
        self.cached_connection = Some((connection_id, Instant::now()));
        debug!(connection_id, "UDP tracker connect succeeded");
        Ok(connection_id)
    }

    #[instrument(skip(self, request))]
    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let connection_id = self.ensure_connected().await?;
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut packet = [0u8; 98];
        BigEndian::write_u64(&mut packet[0..8], connection_id);
        BigEndian::write_u32(&mut packet[8..12], ACTION_ANNOUNCE);
        BigEndian::write_u32(&mut packet[12..16], transaction_id);
        packet[16..36].copy_from_slice(&request.info_hash);
        packet[36..56].copy_from_slice(&request.peer_id);
        BigEndian::write_u64(&mut packet[56..64], request.downloaded);
        BigEndian::write_u64(&mut packet[64..72], request.left);
        BigEndian::write_u64(&mut packet[72..80], request.uploaded);
        BigEndian::write_u32(&mut packet[80..84], event_code(request.event));
        BigEndian::write_u32(&mut packet[84..88], 0); // ip = 0 (use sender's source address)
        BigEndian::write_u32(&mut packet[88..92], key);
        BigEndian::write_i32(&mut packet[92..96], -1); // num_want = -1 (default)
        BigEndian::write_u16(&mut packet[96..98], request.port);

        let response = self.transact(&packet).await?;
        if response.len() < 8 {
            return Err(TrackerError::InvalidResponse("announce response too short".to_string()));
        }
        let action = BigEndian::read_u32(&response[0..4]);
        let resp_transaction_id = BigEndian::read_u32(&response[4..8]);
        if resp_transaction_id != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "announce response transaction id mismatch".to_string(),
            ));
        }

        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&response[8..]).into_owned();
            return Err(TrackerError::UdpError(message));
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::InvalidResponse(format!("unexpected action {action}")));
        }
        if response.len() < 20 {
            return Err(TrackerError::InvalidResponse("announce header truncated".to_string()));
        }

        let interval_secs = BigEndian::read_u32(&response[8..12]) as u64;
        let leechers = BigEndian::read_u32(&response[12..16]);
        let seeders = BigEndian::read_u32(&response[16..20]);
        let peer_bytes = &response[20..];
        if peer_bytes.len() % 6 != 0 {
            return Err(TrackerError::MalformedCompactPeers);
        }
        let peers = peer_bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer { addr: SocketAddr::new(IpAddr::V4(ip), port) }
            })
            .collect();

        Ok(AnnounceResponse {
            interval_secs,
            complete: Some(seeders),
            incomplete: Some(leechers),
            peers,
        })
    }
}

fn event_code(event: super::Event) -> u32 {
    match event {
        super::Event::None => 0,
        super::Event::Completed => 1,
        super::Event::Started => 2,
        super::Event::Stopped => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(super::super::Event::None), 0);
        assert_eq!(event_code(super::super::Event::Completed), 1);
        assert_eq!(event_code(super::super::Event::Started), 2);
        assert_eq!(event_code(super::super::Event::Stopped), 3);
    }

    #[tokio::test]
    async fn connect_and_announce_round_trip_against_a_fake_udp_tracker() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = UdpTrackerClient::connect_socket(server_addr).await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            // Connect request.
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let transaction_id = BigEndian::read_u32(&buf[12..16]);
            assert_eq!(n, 16);
            let mut response = [0u8; 16];
            BigEndian::write_u32(&mut response[0..4], ACTION_CONNECT);
            BigEndian::write_u32(&mut response[4..8], transaction_id);
            BigEndian::write_u64(&mut response[8..16], 0xdead_beef);
            server.send_to(&response, peer).await.unwrap();

            // Announce request.
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            let transaction_id = BigEndian::read_u32(&buf[12..16]);
            let mut response = Vec::new();
            response.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
            response.extend_from_slice(&transaction_id.to_be_bytes());
            response.extend_from_slice(&1800u32.to_be_bytes()); // interval
            response.extend_from_slice(&2u32.to_be_bytes()); // leechers
            response.extend_from_slice(&5u32.to_be_bytes()); // seeders
            response.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]); // one peer
            server.send_to(&response, peer).await.unwrap();
        });

        let request = AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: super::super::Event::Started,
        };
        let response = client.announce(&request).await.unwrap();
        assert_eq!(response.interval_secs, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr.port(), 6881);
        server_task.await.unwrap();
    }
}
