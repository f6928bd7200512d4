use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;

use crate::messages::{MessageError, PeerMessage};
use crate::peer::conn::{BoxedMsgStream, PeerWriter};
use crate::peer::error::PeerError;
use crate::peer::{PeerCommand, PeerEvent, PeerTask};

/// this enum is used to select between the different streams a peer task receives from
#[derive(Debug)]
pub(super) enum Msg {
    Command(PeerCommand),
    Data(PeerMessage),
    ReadError(MessageError),
    RemoteClosed,
    /// nothing arrived within the idle timeout
    Timeout,
    KeepAlive,
}

impl PeerTask {
    /// Forwards every frame to the session and writes whatever it sends back. Returns `Ok`
    /// only when the session asked for the shutdown.
    pub(super) async fn event_loop(
        &mut self,
        mut peer_writer: PeerWriter,
        mut receiver_stream: BoxedMsgStream,
    ) -> Result<(), PeerError> {
        let mut last_sent = Instant::now();
        loop {
            let Some(message) = receiver_stream.next().await else {
                break Err(PeerError::PeerDisconnected);
            };
            match message {
                Msg::Data(message) => {
                    if let PeerMessage::Piece(piece) = &message {
                        tracing::trace!(
                            "got block {}+{} from {}",
                            piece.index,
                            piece.begin,
                            self.addr
                        );
                    } else {
                        tracing::trace!("got {} from {}", message.name(), self.addr);
                    }
                    self.emit(PeerEvent::Message(message)).await?;
                }
                Msg::Command(PeerCommand::Send(message)) => {
                    peer_writer.send(message).await?;
                    last_sent = Instant::now();
                }
                Msg::Command(PeerCommand::Shutdown) => {
                    let _ = peer_writer.close().await;
                    break Ok(());
                }
                Msg::KeepAlive => {
                    if last_sent.elapsed() >= self.network.keep_alive {
                        peer_writer.send(PeerMessage::KeepAlive).await?;
                        last_sent = Instant::now();
                    }
                }
                Msg::ReadError(error) => {
                    if error.is_protocol_violation() {
                        tracing::warn!("peer {} sent a malformed frame: {error}", self.addr);
                    }
                    break Err(error.into());
                }
                Msg::RemoteClosed => break Err(PeerError::PeerDisconnected),
                Msg::Timeout => break Err(PeerError::Timeout(self.network.idle_timeout)),
            }
        }
    }
}
