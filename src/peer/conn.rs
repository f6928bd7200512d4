use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::{SplitSink, SplitStream, unfold};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::time::FutureExt;

use crate::config::NetworkConfig;
use crate::messages::{MessageFramer, PeerMessage};
use crate::peer::error::PeerError;
use crate::peer::event_loop::Msg;
use crate::peer::{Handshake, PeerCommand, PeerEvent, PeerId, PeerKey};
use crate::session::SessionMsg;
use crate::torrent::InfoHash;

pub(super) type BoxedMsgStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;
pub(super) type PeerWriter = SplitSink<Framed<TcpStream, MessageFramer>, PeerMessage>;
type PeerReader = SplitStream<Framed<TcpStream, MessageFramer>>;

/// The socket side of one peer connection. Runs as its own task and talks to the owning
/// session only through messages.
pub struct PeerTask {
    pub(super) key: PeerKey,
    pub(super) addr: SocketAddr,
    info_hash: InfoHash,
    our_id: PeerId,
    session_tx: mpsc::Sender<SessionMsg>,
    cancel: CancellationToken,
    pub(super) network: NetworkConfig,
}

impl PeerTask {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        info_hash: InfoHash,
        our_id: PeerId,
        session_tx: mpsc::Sender<SessionMsg>,
        cancel: CancellationToken,
        network: NetworkConfig,
    ) -> Self {
        Self {
            key,
            addr,
            info_hash,
            our_id,
            session_tx,
            cancel,
            network,
        }
    }

    /// Dials the peer, shakes hands and runs the connection until it closes.
    pub async fn run_outbound(mut self, commands: mpsc::Receiver<PeerCommand>) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = self.connect_and_run(commands) => self.report_closed(result).await,
        }
    }

    /// Runs a connection the manager accepted. The remote handshake has already been read
    /// and routed here by its infohash, so only ours is left to send.
    pub async fn run_inbound(
        mut self,
        tcp: TcpStream,
        remote: Handshake,
        commands: mpsc::Receiver<PeerCommand>,
    ) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = self.accept_and_run(tcp, remote, commands) => self.report_closed(result).await,
        }
    }

    async fn connect_and_run(
        &mut self,
        commands: mpsc::Receiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        let mut tcp = TcpStream::connect(self.addr)
            .timeout(self.network.connect_timeout)
            .await
            .map_err(|_| PeerError::ConnectTimeout(self.addr))?
            .map_err(|error| PeerError::FailedToConnect {
                error,
                addr: self.addr,
            })?;
        self.emit(PeerEvent::Handshaking).await?;

        let remote = Handshake::new(self.info_hash.0, self.our_id.0)
            .shake_hands(&mut tcp)
            .timeout(self.network.connect_timeout)
            .await
            .map_err(|_| PeerError::Timeout(self.network.connect_timeout))??;
        self.run(tcp, remote, commands).await
    }

    async fn accept_and_run(
        &mut self,
        mut tcp: TcpStream,
        remote: Handshake,
        commands: mpsc::Receiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        Handshake::new(self.info_hash.0, self.our_id.0)
            .write_to(&mut tcp)
            .await?;
        self.run(tcp, remote, commands).await
    }

    async fn run(
        &mut self,
        tcp: TcpStream,
        remote: Handshake,
        commands: mpsc::Receiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        tracing::debug!("peer {} connected as {}", self.addr, self.key);
        self.emit(PeerEvent::Connected(PeerId(remote.peer_id)))
            .await?;

        // after the handshake the framer de- & encodes the messages of the tcp stream
        let framed = Framed::new(tcp, MessageFramer);
        let (peer_writer, peer_reader) = framed.split();
        let stream = get_stream(
            peer_reader,
            commands,
            self.network.idle_timeout,
            self.network.keep_alive,
        );
        self.event_loop(peer_writer, stream).await
    }

    pub(super) async fn emit(&self, event: PeerEvent) -> Result<(), PeerError> {
        self.session_tx
            .send(SessionMsg::Peer {
                key: self.key,
                event,
            })
            .await
            .map_err(|_| PeerError::SessionGone)
    }

    async fn report_closed(&self, result: Result<(), PeerError>) {
        let reason = match result {
            Ok(()) => None,
            Err(PeerError::SessionGone) => return,
            Err(error) => {
                tracing::debug!("peer {} ({}) closed: {error}", self.addr, self.key);
                Some(error)
            }
        };
        let _ = self.emit(PeerEvent::Closed(reason)).await;
    }
}

/// Merges everything the connection reacts to into one stream: frames from the remote,
/// commands from the session and the keep-alive timer.
fn get_stream(
    peer_reader: PeerReader,
    commands: mpsc::Receiver<PeerCommand>,
    idle_timeout: Duration,
    keep_alive: Duration,
) -> BoxedMsgStream {
    let peer_msg_stream = unfold(Some(peer_reader), move |reader| async move {
        let mut reader = reader?;
        match reader.next().timeout(idle_timeout).await {
            Ok(Some(Ok(message))) => Some((Msg::Data(message), Some(reader))),
            Ok(Some(Err(error))) => Some((Msg::ReadError(error), None)),
            Ok(None) => Some((Msg::RemoteClosed, None)),
            Err(_) => Some((Msg::Timeout, None)),
        }
    });

    // a dropped sender means the session let go of this peer
    let command_stream = unfold(commands, |mut rx| async move {
        let command = rx.recv().await.unwrap_or(PeerCommand::Shutdown);
        Some((Msg::Command(command), rx))
    });

    let interval = tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);
    let keep_alive_stream = unfold(interval, |mut interval| async move {
        interval.tick().await;
        Some((Msg::KeepAlive, interval))
    });

    let stream = futures_util::stream::select(
        peer_msg_stream,
        futures_util::stream::select(command_stream, keep_alive_stream),
    );
    Box::pin(stream)
}
