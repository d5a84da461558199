//! Binary entry point: wires the CLI, configuration, torrent/magnet
//! descriptor, file store, piece manager, peer connections, tracker and DHT
//! discovery, and the status printer into a runnable download session.
mod cli;
mod config;
mod logging;
mod status;

use anyhow::{Context, Result};
use clap::Parser;
use rand::seq::SliceRandom;
use rs_torrent_client::coordinator::assignment::{AssignmentLoop, PeerDownloadInfo};
use rs_torrent_client::dht::{self, DhtServer, NodeId};
use rs_torrent_client::peer::connection::{ConnectionCommand, ConnectionEvent, PeerConnection};
use rs_torrent_client::peer::extension::{ExtendedHandshake, MetadataAssembler, UT_METADATA_LOCAL_ID, UT_METADATA_NAME};
use rs_torrent_client::piece::{PieceManager, SelectionStrategy};
use rs_torrent_client::ratelimit::{SpeedTracker, TokenBucket};
use rs_torrent_client::store::{self, FileStore, FileSystemStore};
use rs_torrent_client::torrent::{MagnetDescriptor, TorrentDescriptor};
use rs_torrent_client::tracker::{self, http::HttpTrackerClient, AnnounceRequest, Event};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::interval;
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const ASSIGNMENT_INTERVAL: Duration = Duration::from_millis(500);
const DHT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const MAX_ANNOUNCE_ATTEMPTS: u32 = 10;
const MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(60);

struct PeerHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    have: rs_torrent_client::peer::Bitfield,
    can_download: bool,
    handshake_complete: bool,
}

/// Shared state mutated by the peer event loop, the assignment tick, and the
/// status printer.
struct Session {
    descriptor: TorrentDescriptor,
    our_peer_id: [u8; 20],
    manager: RwLock<PieceManager>,
    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
    download_speed: Mutex<SpeedTracker>,
    upload_speed: Mutex<SpeedTracker>,
    download_limiter: TokenBucket,
    upload_limiter: TokenBucket,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::Config::default().merge_cli(&cli);
    logging::init(&config.log_level);
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let our_peer_id = tracker::generate_peer_id();
    let descriptor = match resolve_descriptor(&cli, our_peer_id, &config).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("could not resolve torrent source: {e:#}");
            std::process::exit(1);
        }
    };

    let exit_code = match run(descriptor, our_peer_id, config).await {
        Ok(_completed) => 0,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            2
        }
    };
    std::process::exit(exit_code)
}

/// Parses the CLI's `source` argument as either a `.torrent` file or a
/// magnet URI, fetching the metadata over the wire for the latter.
async fn resolve_descriptor(cli: &cli::Cli, our_peer_id: [u8; 20], config: &config::Config) -> Result<TorrentDescriptor> {
    if cli.source.starts_with("magnet:?") {
        let magnet = MagnetDescriptor::parse(&cli.source).map_err(|e| anyhow::anyhow!(e))?;
        info!(info_hash = %hex::encode(magnet.info_fingerprint), "fetching metadata for magnet link");
        fetch_magnet_descriptor(&magnet, our_peer_id, config).await
    } else {
        let bytes = std::fs::read(&cli.source).with_context(|| format!("reading {}", cli.source))?;
        TorrentDescriptor::parse(&bytes).context("parsing torrent file")
    }
}

/// Returns `Ok(true)` if the download ran to completion before the process
/// was asked to stop.
async fn run(descriptor: TorrentDescriptor, our_peer_id: [u8; 20], config: config::Config) -> Result<bool> {
    let root = store::root_for(&config.download_dir, &descriptor.name);
    let file_store = Arc::new(FileSystemStore::initialize(&root, &descriptor).await.context("initializing file store")?);

    let manager = PieceManager::new(
        descriptor.piece_length as u32,
        descriptor.total_length() as u64,
        descriptor.piece_fingerprints.clone(),
    );

    let session = Arc::new(Session {
        descriptor: descriptor.clone(),
        our_peer_id,
        manager: RwLock::new(manager),
        peers: Mutex::new(HashMap::new()),
        download_speed: Mutex::new(SpeedTracker::new()),
        upload_speed: Mutex::new(SpeedTracker::new()),
        download_limiter: TokenBucket::new(config.max_download_speed),
        upload_limiter: TokenBucket::new(config.max_upload_speed),
        started_at: Instant::now(),
    });

    let (events_tx, mut events_rx) = mpsc::channel::<(SocketAddr, ConnectionEvent)>(1024);

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await.context("binding listen port")?;
    tokio::spawn(accept_loop(Arc::clone(&session), listener, events_tx.clone()));

    let dht = if config.enable_dht {
        let server = DhtServer::bind(NodeId::random(), config.dht_port).await.context("binding DHT socket")?;
        tokio::spawn(Arc::clone(&server).run());
        Some(server)
    } else {
        None
    };

    tokio::spawn(tracker_loop(Arc::clone(&session), config.clone(), events_tx.clone()));
    if let Some(dht) = dht.clone() {
        tokio::spawn(dht_loop(Arc::clone(&session), dht, config.clone(), events_tx.clone()));
    }
    let mut assignment = AssignmentLoop::with_endgame_threshold(
        if config.sequential_download { SelectionStrategy::Sequential } else { SelectionStrategy::RarestFirst },
        config.endgame_threshold,
    );
    let mut assignment_ticker = interval(ASSIGNMENT_INTERVAL);
    let mut status_ticker = interval(STATUS_INTERVAL);
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    let completed = loop {
        if session.manager.read().await.is_complete() {
            break true;
        }
        tokio::select! {
            _ = &mut shutdown => {
                info!("received interrupt, shutting down");
                break false;
            }
            Some((addr, event)) = events_rx.recv() => {
                handle_event(&session, &file_store, &mut assignment, addr, event, &events_tx).await;
            }
            _ = assignment_ticker.tick() => {
                run_assignment_tick(&session, &mut assignment).await;
            }
            _ = status_ticker.tick() => {
                print_status(&session, assignment.is_endgame()).await;
            }
        }
    };

    let final_event = if completed { Event::Completed } else { Event::Stopped };
    send_final_announce(&session, &config, final_event).await;

    println!();
    let summary = status::ShutdownSummary {
        total_downloaded: {
            let manager = session.manager.read().await;
            manager.downloaded_count() as u64 * descriptor.piece_length as u64
        },
        total_uploaded: 0,
        elapsed: session.started_at.elapsed(),
        completed,
    };
    println!("{}", summary.render());

    Ok(completed)
}

async fn fetch_magnet_descriptor(
    magnet: &MagnetDescriptor,
    our_peer_id: [u8; 20],
    config: &config::Config,
) -> Result<TorrentDescriptor> {
    let announce = magnet.trackers.first().cloned().unwrap_or_default();
    let mut peers = Vec::new();
    if !announce.is_empty() {
        let client = HttpTrackerClient::new();
        let request = AnnounceRequest {
            info_hash: magnet.info_fingerprint,
            peer_id: our_peer_id,
            port: config.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Event::Started,
        };
        if let Ok(response) = client.announce(&announce, &request).await {
            peers.extend(response.peers.into_iter().map(|p| p.addr));
        }
    }

    for addr in peers {
        if let Ok(bytes) = fetch_metadata_from_peer(addr, magnet.info_fingerprint, our_peer_id).await {
            return TorrentDescriptor::from_metadata(&announce, &bytes).map_err(Into::into);
        }
    }
    anyhow::bail!("could not fetch torrent metadata from any known peer")
}

async fn fetch_metadata_from_peer(addr: SocketAddr, info_hash: [u8; 20], our_peer_id: [u8; 20]) -> Result<Vec<u8>> {
    let (connection, stream) = PeerConnection::connect(addr, info_hash, our_peer_id, 1).await?;
    let (command_tx, command_rx) = mpsc::channel(32);
    let (events_tx, mut events_rx) = mpsc::channel(32);
    tokio::spawn(connection.run(stream, command_rx, events_tx));

    let mut handshake = ExtendedHandshake::default();
    handshake.m.insert(UT_METADATA_NAME.to_string(), UT_METADATA_LOCAL_ID);
    command_tx.send(ConnectionCommand::SendExtendedHandshake(handshake)).await.ok();

    let mut assembler: Option<MetadataAssembler> = None;
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => anyhow::bail!("metadata fetch timed out"),
            event = events_rx.recv() => {
                match event {
                    Some(ConnectionEvent::ExtendedHandshakeReceived { metadata_size: Some(size) }) => {
                        let a = MetadataAssembler::new(size as usize, info_hash);
                        for piece in 0..a.num_pieces() {
                            let _ = command_tx.send(ConnectionCommand::RequestMetadataPiece(piece as u32)).await;
                        }
                        assembler = Some(a);
                    }
                    Some(ConnectionEvent::MetadataBlockReceived { piece, data, .. }) => {
                        if let Some(a) = assembler.as_mut() {
                            let _ = a.accept(piece, data);
                            if let Ok(Some(bytes)) = a.try_finish() {
                                return Ok(bytes);
                            }
                        }
                    }
                    Some(ConnectionEvent::Disconnected { reason }) => anyhow::bail!("peer disconnected: {reason}"),
                    None => anyhow::bail!("peer connection closed"),
                    _ => {}
                }
            }
        }
    }
}

async fn accept_loop(session: Arc<Session>, listener: TcpListener, events_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let session = Arc::clone(&session);
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let num_pieces = session.descriptor.num_pieces();
                    match PeerConnection::accept(stream, addr, session.descriptor.info_fingerprint, session.our_peer_id, num_pieces).await {
                        Ok((connection, stream)) => spawn_peer(session, connection, stream, addr, events_tx).await,
                        Err(e) => warn!(%addr, error = %e, "inbound handshake failed"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn connect_to_peer(session: Arc<Session>, addr: SocketAddr, events_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>) {
    if session.peers.lock().await.contains_key(&addr) {
        return;
    }
    let num_pieces = session.descriptor.num_pieces();
    match PeerConnection::connect(addr, session.descriptor.info_fingerprint, session.our_peer_id, num_pieces).await {
        Ok((connection, stream)) => spawn_peer(session, connection, stream, addr, events_tx).await,
        Err(e) => warn!(%addr, error = %e, "outbound connect failed"),
    }
}

async fn spawn_peer(
    session: Arc<Session>,
    connection: PeerConnection,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    events_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>,
) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let num_pieces = session.descriptor.num_pieces();
    session.peers.lock().await.insert(
        addr,
        PeerHandle {
            command_tx,
            have: rs_torrent_client::peer::Bitfield::new(num_pieces),
            can_download: false,
            handshake_complete: false,
        },
    );

    let (driver_tx, mut driver_rx) = mpsc::channel(256);
    tokio::spawn(connection.run(stream, command_rx, driver_tx));

    tokio::spawn(async move {
        while let Some(event) = driver_rx.recv().await {
            if events_tx.send((addr, event)).await.is_err() {
                break;
            }
        }
    });
}

async fn handle_event(
    session: &Arc<Session>,
    file_store: &Arc<FileSystemStore>,
    assignment: &mut AssignmentLoop,
    addr: SocketAddr,
    event: ConnectionEvent,
    events_tx: &mpsc::Sender<(SocketAddr, ConnectionEvent)>,
) {
    let mut peers = session.peers.lock().await;
    let Some(handle) = peers.get_mut(&addr) else { return };

    match event {
        ConnectionEvent::HandshakeCompleted { .. } => {
            handle.handshake_complete = true;
            let have = session.manager.read().await.have_snapshot();
            let _ = handle.command_tx.send(ConnectionCommand::SendBitfield(have.as_wire_bytes().to_vec())).await;
            let _ = handle.command_tx.send(ConnectionCommand::SendInterested(true)).await;
        }
        ConnectionEvent::Unchoked => handle.can_download = true,
        ConnectionEvent::Choked => handle.can_download = false,
        ConnectionEvent::Have { piece_index } => handle.have.set(piece_index as usize),
        ConnectionEvent::BitfieldReceived => {}
        ConnectionEvent::RequestsCancelledByChoke { .. } => {}
        ConnectionEvent::BlockRequested { piece_index, offset, length } => {
            let command_tx = handle.command_tx.clone();
            let file_store = Arc::clone(file_store);
            let limiter_bytes = length as u64;
            session.upload_limiter.acquire(limiter_bytes).await;
            session.upload_speed.lock().await.record(limiter_bytes);
            tokio::spawn(async move {
                if let Ok(piece_bytes) = file_store.read_piece(piece_index as usize).await {
                    let start = offset as usize;
                    let end = (start + length as usize).min(piece_bytes.len());
                    if start < end {
                        let _ = command_tx
                            .send(ConnectionCommand::SendPiece { piece_index, offset, data: piece_bytes[start..end].to_vec() })
                            .await;
                    }
                }
            });
        }
        ConnectionEvent::BlockReceived { piece_index, offset, data } => {
            let command_tx = handle.command_tx.clone();
            drop(peers);
            session.download_speed.lock().await.record(data.len() as u64);
            session.download_limiter.acquire(data.len() as u64).await;

            let mut manager = session.manager.write().await;
            let _ = manager.add_block(piece_index as usize, offset, &data);
            if manager.is_piece_ready_to_verify(piece_index as usize) {
                match manager.complete_piece(piece_index as usize, file_store.as_ref()).await {
                    Ok(()) => {
                        let holders = assignment.on_piece_completed(piece_index as usize);
                        for holder in holders {
                            if holder != addr {
                                if let Some(other) = session_peer_command(session, holder).await {
                                    let _ = other.send(ConnectionCommand::CancelBlock { piece_index, offset: 0, length: 0 }).await;
                                }
                            }
                        }
                        broadcast_have(session, piece_index).await;
                    }
                    Err(_) => assignment.on_piece_failed(piece_index as usize),
                }
            }
            let _ = command_tx;
            return;
        }
        ConnectionEvent::Disconnected { .. } => {
            peers.remove(&addr);
            drop(peers);
            assignment.on_peer_disconnected(&addr);
            let _ = events_tx;
            return;
        }
        ConnectionEvent::Interested | ConnectionEvent::NotInterested => {}
        ConnectionEvent::ExtendedHandshakeReceived { .. }
        | ConnectionEvent::MetadataBlockReceived { .. }
        | ConnectionEvent::MetadataRequested { .. } => {}
    }
}

async fn session_peer_command(session: &Arc<Session>, addr: SocketAddr) -> Option<mpsc::Sender<ConnectionCommand>> {
    session.peers.lock().await.get(&addr).map(|h| h.command_tx.clone())
}

async fn broadcast_have(session: &Arc<Session>, piece_index: u32) {
    let peers = session.peers.lock().await;
    for handle in peers.values() {
        let _ = handle.command_tx.send(ConnectionCommand::SendHave(piece_index)).await;
    }
}

async fn run_assignment_tick(session: &Arc<Session>, assignment: &mut AssignmentLoop) {
    let peers = session.peers.lock().await;
    let download_info: HashMap<SocketAddr, PeerDownloadInfo> = peers
        .iter()
        .filter(|(_, h)| h.handshake_complete)
        .map(|(addr, h)| (*addr, PeerDownloadInfo { can_download: h.can_download, have: h.have.clone() }))
        .collect();
    let commands: HashMap<SocketAddr, mpsc::Sender<ConnectionCommand>> =
        peers.iter().map(|(addr, h)| (*addr, h.command_tx.clone())).collect();
    drop(peers);

    let manager = session.manager.read().await;
    let mut rng = rand::rng();
    let new_assignments = assignment.tick(&download_info, &manager, &mut rng);
    for (addr, piece_index) in new_assignments {
        let Some(command_tx) = commands.get(&addr) else { continue };
        for block in manager.blocks_for_piece(piece_index).unwrap_or_default() {
            let _ = command_tx
                .send(ConnectionCommand::RequestBlock { piece_index: piece_index as u32, offset: block.offset, length: block.length })
                .await;
        }
    }
}

async fn print_status(session: &Arc<Session>, endgame: bool) {
    let manager = session.manager.read().await;
    let percent = 100.0 * manager.downloaded_count() as f64 / manager.num_pieces().max(1) as f64;
    let connected_peers = session.peers.lock().await.len();
    let (down, up) = {
        let mut d = session.download_speed.lock().await;
        let mut u = session.upload_speed.lock().await;
        status::current_rates(&mut d, &mut u)
    };
    let mode = if manager.is_complete() {
        status::Mode::Seeding
    } else if endgame {
        status::Mode::Endgame
    } else {
        status::Mode::Downloading
    };
    let line = status::StatusLine {
        percent_complete: percent,
        download_speed: down,
        upload_speed: up,
        connected_peers,
        mode,
    };
    line.print_inline(&mut std::io::stdout());
}

/// Announces with exponential backoff on failure: 1s, 2s, 4s, ... capped at
/// 60s, up to `MAX_ANNOUNCE_ATTEMPTS` tries. Returns `None` once the budget
/// is exhausted; the caller simply waits for its next scheduled announce and
/// keeps using whatever peers it already has.
async fn announce_with_backoff(
    client: &HttpTrackerClient,
    announce_url: &str,
    request: &AnnounceRequest,
) -> Option<rs_torrent_client::tracker::AnnounceResponse> {
    let mut backoff = Duration::from_secs(1);
    for attempt in 1..=MAX_ANNOUNCE_ATTEMPTS {
        match client.announce(announce_url, request).await {
            Ok(response) => return Some(response),
            Err(e) => {
                warn!(tracker = announce_url, attempt, error = %e, "tracker announce failed");
                if attempt == MAX_ANNOUNCE_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ANNOUNCE_BACKOFF);
            }
        }
    }
    None
}

/// Announces `event`, retrying with backoff, and dials every peer the
/// tracker hands back.
async fn send_tracker_announce(
    session: &Arc<Session>,
    client: &HttpTrackerClient,
    config: &config::Config,
    events_tx: &mpsc::Sender<(SocketAddr, ConnectionEvent)>,
    event: Event,
) {
    let (downloaded, left) = {
        let manager = session.manager.read().await;
        let downloaded = manager.downloaded_count() as u64 * session.descriptor.piece_length as u64;
        let left = session.descriptor.total_length() as u64 - downloaded.min(session.descriptor.total_length() as u64);
        (downloaded, left)
    };
    let request = AnnounceRequest {
        info_hash: session.descriptor.info_fingerprint,
        peer_id: session.our_peer_id,
        port: config.listen_port,
        uploaded: 0,
        downloaded,
        left,
        event,
    };
    if let Some(response) = announce_with_backoff(client, &session.descriptor.announce, &request).await {
        let mut addrs: Vec<SocketAddr> = response.peers.into_iter().map(|p| p.addr).collect();
        addrs.shuffle(&mut rand::rng());
        for addr in addrs.into_iter().take(config.max_peers) {
            tokio::spawn(connect_to_peer(Arc::clone(session), addr, events_tx.clone()));
        }
    }
}

/// One best-effort announce with no retry, used for the terminal
/// `completed`/`stopped` events where blocking shutdown on backoff would be
/// worse than simply not reaching the tracker this time.
async fn send_final_announce(session: &Arc<Session>, config: &config::Config, event: Event) {
    let client = HttpTrackerClient::new();
    let (downloaded, left) = {
        let manager = session.manager.read().await;
        let downloaded = manager.downloaded_count() as u64 * session.descriptor.piece_length as u64;
        let left = session.descriptor.total_length() as u64 - downloaded.min(session.descriptor.total_length() as u64);
        (downloaded, left)
    };
    let request = AnnounceRequest {
        info_hash: session.descriptor.info_fingerprint,
        peer_id: session.our_peer_id,
        port: config.listen_port,
        uploaded: 0,
        downloaded,
        left,
        event,
    };
    if let Err(e) = client.announce(&session.descriptor.announce, &request).await {
        warn!(tracker = %session.descriptor.announce, error = %e, "final tracker announce failed");
    }
}

async fn tracker_loop(session: Arc<Session>, config: config::Config, events_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>) {
    let client = HttpTrackerClient::new();
    let mut ticker = interval(config.tracker_announce_interval);
    ticker.tick().await; // interval's first tick fires immediately; consume it so the loop below starts a full interval after the initial announce

    send_tracker_announce(&session, &client, &config, &events_tx, Event::Started).await;

    loop {
        ticker.tick().await;
        send_tracker_announce(&session, &client, &config, &events_tx, Event::None).await;
    }
}

async fn dht_loop(
    session: Arc<Session>,
    server: Arc<DhtServer>,
    config: config::Config,
    events_tx: mpsc::Sender<(SocketAddr, ConnectionEvent)>,
) {
    let mut ticker = interval(DHT_MAINTENANCE_INTERVAL);
    loop {
        ticker.tick().await;
        server.run_maintenance_tick().await;
        let seed = server.closest_known(&NodeId(session.descriptor.info_fingerprint), 8).await;
        if seed.is_empty() {
            continue;
        }
        let result = dht::lookup::get_peers(&server, session.descriptor.info_fingerprint, seed).await;
        for addr in result.peers.into_iter().take(config.max_peers) {
            tokio::spawn(connect_to_peer(Arc::clone(&session), addr, events_tx.clone()));
        }
    }
}
