//! HTTP tracker client (BEP 3): a GET request against the announce URL,
//! bencoded response.
use super::{AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, instrument};

pub struct HttpTrackerClient {
    client: reqwest::Client,
}

impl Default for HttpTrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTrackerClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    #[instrument(skip(self, request), fields(%announce_url))]
    pub async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(announce_url)?;
        let params = [
            ("info_hash", super::url_encode(&request.info_hash)),
            ("peer_id", super::url_encode(&request.peer_id)),
            ("port", request.port.to_string()),
            ("uploaded", request.uploaded.to_string()),
            ("downloaded", request.downloaded.to_string()),
            ("left", request.left.to_string()),
            ("compact", "1".to_string()),
        ];
        url.query_pairs_mut().extend_pairs(&params).finish();
        if let Some(event) = request.event.as_query_value() {
            url.query_pairs_mut().append_pair("event", event);
        }

        debug!(%url, "issuing tracker announce");
        let response = self.client.get(url).send().await?;
        let bytes = response.bytes().await?;
        Self::parse_announce_response(&bytes)
    }

    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let response: RawAnnounceResponse = serde_bencode::from_bytes(bytes)?;
        if let Some(reason) = response.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let peers = match response.peers.ok_or_else(|| {
            TrackerError::MalformedResponse("missing peers field".to_string())
        })? {
            RawPeers::Compact(bytes) => {
                if bytes.len() % 6 != 0 {
                    return Err(TrackerError::MalformedCompactPeers);
                }
                bytes
                    .chunks_exact(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        Peer { addr: SocketAddr::new(IpAddr::V4(ip), port) }
                    })
                    .collect()
            }
            RawPeers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer { addr: SocketAddr::new(ip, dict.port) })
                })
                .collect(),
        };

        Ok(AnnounceResponse {
            interval_secs: response.interval.unwrap_or(1800).max(0) as u64,
            complete: response.complete,
            incomplete: response.incomplete,
            peers,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    complete: Option<u32>,
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(default)]
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(Vec<u8>),
    NonCompact(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}
