//! Per-peer driver task: one spawned per connection, owning its session
//! state and translating between the wire protocol and the coordinator's
//! event/command channels.
use super::extension::{ExtendedHandshake, MetadataMessage, UT_METADATA_NAME};
use super::message::Message;
use super::session::{BlockKey, PeerSession};
use super::{Handshake, PeerError, PeerResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, instrument, warn};

/// Zero-length frame sent when no other outbound traffic has occurred for
/// this long.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Events a driver task reports up to the coordinator.
#[derive(Debug)]
pub enum ConnectionEvent {
    HandshakeCompleted { peer_id: [u8; 20], supports_extension_protocol: bool, supports_dht: bool },
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    BitfieldReceived,
    BlockReceived { piece_index: u32, offset: u32, data: Vec<u8> },
    BlockRequested { piece_index: u32, offset: u32, length: u32 },
    RequestsCancelledByChoke { keys: Vec<BlockKey> },
    ExtendedHandshakeReceived { metadata_size: Option<i64> },
    MetadataBlockReceived { piece: u32, total_size: u32, data: Vec<u8> },
    MetadataRequested { piece: u32 },
    Disconnected { reason: String },
}

/// Commands the coordinator sends down to a driver task.
#[derive(Debug)]
pub enum ConnectionCommand {
    SendBitfield(Vec<u8>),
    SendHave(u32),
    SendChoke(bool),
    SendInterested(bool),
    RequestBlock { piece_index: u32, offset: u32, length: u32 },
    CancelBlock { piece_index: u32, offset: u32, length: u32 },
    SendPiece { piece_index: u32, offset: u32, data: Vec<u8> },
    SendExtendedHandshake(ExtendedHandshake),
    RequestMetadataPiece(u32),
    SendMetadataData { piece: u32, total_size: u32, data: Vec<u8> },
    Shutdown,
}

/// Drives one peer connection end to end: performs the handshake, then
/// loops reading frames and servicing coordinator commands until the
/// connection ends.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub session: PeerSession,
}

impl PeerConnection {
    /// Connects outbound to `addr`, performs the handshake, and validates
    /// the peer's info-fingerprint.
    #[instrument(skip(our_peer_id), level = "debug")]
    pub async fn connect(
        addr: SocketAddr,
        info_fingerprint: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
    ) -> PeerResult<(Self, TcpStream)> {
        let mut stream = TcpStream::connect(addr).await?;
        let ours = Handshake::new(info_fingerprint, our_peer_id);
        ours.write(&mut stream).await?;
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(info_fingerprint)?;

        let mut session = PeerSession::new(theirs.peer_id, num_pieces);
        session.supports_extension_protocol = theirs.supports_extension_protocol();
        session.supports_dht = theirs.supports_dht();
        session.supports_fast_extension = theirs.supports_fast_extension();

        Ok((Self { addr, session }, stream))
    }

    /// Accepts an inbound handshake on an already-accepted stream and
    /// responds with ours.
    #[instrument(skip(stream, our_peer_id), level = "debug")]
    pub async fn accept(
        mut stream: TcpStream,
        addr: SocketAddr,
        info_fingerprint: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
    ) -> PeerResult<(Self, TcpStream)> {
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(info_fingerprint)?;
        let ours = Handshake::new(info_fingerprint, our_peer_id);
        ours.write(&mut stream).await?;

        let mut session = PeerSession::new(theirs.peer_id, num_pieces);
        session.supports_extension_protocol = theirs.supports_extension_protocol();
        session.supports_dht = theirs.supports_dht();
        session.supports_fast_extension = theirs.supports_fast_extension();

        Ok((Self { addr, session }, stream))
    }

    /// Runs the post-handshake message loop until the peer disconnects, an
    /// unrecoverable protocol error occurs, or `Shutdown` is commanded.
    #[instrument(skip(self, stream, commands, events), fields(addr = %self.addr))]
    pub async fn run(
        mut self,
        stream: TcpStream,
        mut commands: mpsc::Receiver<ConnectionCommand>,
        events: mpsc::Sender<ConnectionEvent>,
    ) {
        let _ = events
            .send(ConnectionEvent::HandshakeCompleted {
                peer_id: self.session.peer_id,
                supports_extension_protocol: self.session.supports_extension_protocol,
                supports_dht: self.session.supports_dht,
            })
            .await;

        let (mut reader, mut writer) = stream.into_split();
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Shutdown) | None => break "shutdown".to_string(),
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(&mut writer, cmd).await {
                                break format!("command write failed: {e}");
                            }
                        }
                    }
                }

                read_result = Message::read(&mut reader) => {
                    match read_result {
                        Ok(message) => {
                            self.session.touch();
                            if let Err(e) = self.handle_message(message, &events).await {
                                break format!("protocol error: {e}");
                            }
                        }
                        Err(e) => break format!("read failed: {e}"),
                    }
                }

                _ = keep_alive.tick() => {
                    if let Err(e) = Message::KeepAlive.write(&mut writer).await {
                        break format!("keep-alive write failed: {e}");
                    }
                }
            }
        };

        debug!(reason = %reason, "peer connection ending");
        let _ = events.send(ConnectionEvent::Disconnected { reason }).await;
    }

    async fn handle_command<W: AsyncWriteExt + Unpin>(
        &mut self,
        writer: &mut W,
        cmd: ConnectionCommand,
    ) -> PeerResult<()> {
        match cmd {
            ConnectionCommand::SendBitfield(bits) => {
                Message::Bitfield { bits }.write(writer).await
            }
            ConnectionCommand::SendHave(piece_index) => {
                Message::Have { piece_index }.write(writer).await
            }
            ConnectionCommand::SendChoke(choke) => {
                self.session.flags.am_choking = choke;
                let msg = if choke { Message::Choke } else { Message::Unchoke };
                msg.write(writer).await
            }
            ConnectionCommand::SendInterested(interested) => {
                self.session.flags.am_interested = interested;
                let msg = if interested { Message::Interested } else { Message::NotInterested };
                msg.write(writer).await
            }
            ConnectionCommand::RequestBlock { piece_index, offset, length } => {
                let key = BlockKey { piece_index, offset };
                if !self.session.record_request(key, length) {
                    return Ok(());
                }
                Message::Request { piece_index, offset, length }.write(writer).await
            }
            ConnectionCommand::CancelBlock { piece_index, offset, length } => {
                self.session.fulfil_request(BlockKey { piece_index, offset });
                Message::Cancel { piece_index, offset, length }.write(writer).await
            }
            ConnectionCommand::SendPiece { piece_index, offset, data } => {
                Message::Piece { piece_index, offset, data }.write(writer).await
            }
            ConnectionCommand::SendExtendedHandshake(handshake) => {
                Message::Extended { ext_id: 0, payload: handshake.encode() }.write(writer).await
            }
            ConnectionCommand::RequestMetadataPiece(piece) => {
                let ext_id = self.metadata_ext_id()?;
                Message::Extended { ext_id, payload: MetadataMessage::Request { piece }.encode() }
                    .write(writer)
                    .await
            }
            ConnectionCommand::SendMetadataData { piece, total_size, data } => {
                let ext_id = self.metadata_ext_id()?;
                Message::Extended {
                    ext_id,
                    payload: MetadataMessage::Data { piece, total_size, data }.encode(),
                }
                .write(writer)
                .await
            }
            ConnectionCommand::Shutdown => Ok(()),
        }
    }

    fn metadata_ext_id(&self) -> PeerResult<u8> {
        self.session
            .extensions
            .get(UT_METADATA_NAME)
            .copied()
            .ok_or_else(|| PeerError::ExtensionUnsupported(UT_METADATA_NAME.to_string()))
    }

    async fn handle_message(
        &mut self,
        message: Message,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> PeerResult<()> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.session.flags.peer_choking = true;
                let keys = self.session.clear_pending_on_choke();
                let _ = events.send(ConnectionEvent::Choked).await;
                if !keys.is_empty() {
                    let _ = events.send(ConnectionEvent::RequestsCancelledByChoke { keys }).await;
                }
            }
            Message::Unchoke => {
                self.session.flags.peer_choking = false;
                let _ = events.send(ConnectionEvent::Unchoked).await;
            }
            Message::Interested => {
                self.session.flags.peer_interested = true;
                let _ = events.send(ConnectionEvent::Interested).await;
            }
            Message::NotInterested => {
                self.session.flags.peer_interested = false;
                let _ = events.send(ConnectionEvent::NotInterested).await;
            }
            Message::Have { piece_index } => {
                self.session.have.set(piece_index as usize);
                let _ = events.send(ConnectionEvent::Have { piece_index }).await;
            }
            Message::HaveAll => {
                for i in 0..self.session.have.num_pieces() {
                    self.session.have.set(i);
                }
            }
            Message::HaveNone => {}
            Message::Bitfield { bits } => {
                if self.session.bitfield_received {
                    return Err(PeerError::LateBitfield);
                }
                self.session.bitfield_received = true;
                self.session.have =
                    super::bitfield::Bitfield::from_wire_bytes(&bits, self.session.have.num_pieces());
                let _ = events.send(ConnectionEvent::BitfieldReceived).await;
            }
            Message::Request { piece_index, offset, length } => {
                let _ = events
                    .send(ConnectionEvent::BlockRequested { piece_index, offset, length })
                    .await;
            }
            Message::Piece { piece_index, offset, data } => {
                self.session.fulfil_request(BlockKey { piece_index, offset });
                let _ = events
                    .send(ConnectionEvent::BlockReceived { piece_index, offset, data })
                    .await;
            }
            Message::Cancel { .. } => {}
            Message::Port { .. } => {}
            Message::SuggestPiece { .. } | Message::AllowedFast { .. } => {}
            Message::RejectRequest { piece_index, offset, .. } => {
                self.session.fulfil_request(BlockKey { piece_index, offset });
            }
            Message::Extended { ext_id, payload } => self.handle_extended(ext_id, payload, events).await?,
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        ext_id: u8,
        payload: Vec<u8>,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> PeerResult<()> {
        if ext_id == 0 {
            let handshake = ExtendedHandshake::decode(&payload)?;
            self.session.extensions = handshake.m.clone();
            let _ = events
                .send(ConnectionEvent::ExtendedHandshakeReceived { metadata_size: handshake.metadata_size })
                .await;
            return Ok(());
        }
        // The sender addresses messages using the id *we* advertised for
        // this extension in our own extended handshake, not the id they
        // assigned to it in theirs.
        if ext_id == super::extension::UT_METADATA_LOCAL_ID {
            match MetadataMessage::decode(&payload)? {
                MetadataMessage::Request { piece } => {
                    let _ = events.send(ConnectionEvent::MetadataRequested { piece }).await;
                }
                MetadataMessage::Data { piece, total_size, data } => {
                    let _ = events
                        .send(ConnectionEvent::MetadataBlockReceived { piece, total_size, data })
                        .await;
                }
                MetadataMessage::Reject { .. } => {}
            }
            return Ok(());
        }
        warn!(ext_id, "received EXTENDED message for an id we did not advertise");
        Ok(())
    }
}
