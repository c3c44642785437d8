use std::fmt;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::metadata::file::InfoHash;
use crate::metadata::tracker::Peer;
use crate::peer::error::PeerError;
use crate::peer::handshake::{self, Handshake};
use crate::peer::message::{read_frame, write_frame, FrameError, WireMessage};
use crate::peer::peer_id::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Instructions accepted by a connection's supervisor.
#[derive(Debug)]
pub enum Command {
    Send(WireMessage),
    /// Close the transport; `respond_to` fires once the connection is closed.
    Stop { respond_to: oneshot::Sender<()> },
}

/// What a connection reports to its consumer. Messages from one peer arrive
/// in wire order and are always followed by exactly one `Closed` or `Failed`.
#[derive(Debug)]
pub enum PeerEvent {
    Message { peer: Peer, message: WireMessage },
    Closed { peer: Peer },
    Failed { peer: Peer, error: PeerError },
}

impl PeerEvent {
    pub fn peer(&self) -> &Peer {
        match self {
            PeerEvent::Message { peer, .. } | PeerEvent::Closed { peer } | PeerEvent::Failed { peer, .. } => peer,
        }
    }
}

/// Handle to one established peer session. The socket is owned by the
/// connection's own tasks; this handle only talks to them over channels.
#[derive(Debug)]
pub struct PeerConnection {
    peer: Peer,
    info_hash: InfoHash,
    remote_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    supervisor: JoinHandle<()>,
}

impl PeerConnection {
    /// Connects and handshakes with `peer`, then spawns the read loop and
    /// supervisor. Fails without emitting any event if either step fails.
    pub async fn connect(
        peer: Peer,
        info_hash: InfoHash,
        config: &ClientConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (stream, theirs) = match establish(&peer, info_hash, config, &state_tx).await {
            Ok(established) => established,
            Err(e) => {
                state_tx.send_replace(ConnectionState::Failed);
                warn!(%peer, error = %e, "connection failed");
                return Err(e);
            },
        };
        info!(%peer, remote_peer_id = %theirs.peer_id, "connection active");
        state_tx.send_replace(ConnectionState::Active);

        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(read_half, config.max_frame_length, frames_tx, shutdown_rx));

        let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity);
        let supervisor = Supervisor {
            peer: peer.clone(),
            writer: write_half,
            frames: frames_rx,
            commands: commands_rx,
            events,
            state: state_tx,
            reader,
            shutdown: shutdown_tx,
        };
        let supervisor = tokio::spawn(supervisor.run());

        Ok(PeerConnection {
            peer,
            info_hash,
            remote_peer_id: theirs.peer_id,
            commands: commands_tx,
            state: state_rx,
            supervisor,
        })
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Sender for the control channel, for callers that need to stop or
    /// write to the connection without holding the handle.
    pub fn controller(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    pub async fn send(&self, message: WireMessage) -> Result<(), PeerError> {
        self.commands.send(Command::Send(message)).await.map_err(|_| PeerError::ConnectionClosed)
    }

    /// Stops the connection and waits until the transport is closed.
    /// Returns `ConnectionClosed` if it had already ended on its own.
    pub async fn stop(self) -> Result<(), PeerError> {
        let (respond_to, done) = oneshot::channel();
        let sent = self.commands.send(Command::Stop { respond_to }).await;
        let acked = match sent {
            Ok(()) => done.await.map_err(|_| PeerError::ConnectionClosed),
            Err(_) => Err(PeerError::ConnectionClosed),
        };
        if let Err(e) = self.supervisor.await {
            warn!(peer = %self.peer, error = %e, "supervisor task panicked");
        }
        acked
    }

    /// Resolves with the terminal state once the connection has ended.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.state.clone();
        if let Ok(terminal) = state.wait_for(|s| s.is_terminal()).await {
            return *terminal;
        }
        *state.borrow()
    }
}

async fn establish(
    peer: &Peer,
    info_hash: InfoHash,
    config: &ClientConfig,
    state: &watch::Sender<ConnectionState>,
) -> Result<(TcpStream, Handshake), PeerError> {
    debug!(%peer, "connecting");
    let mut stream = timeout(config.connect_timeout, TcpStream::connect(peer.addr()))
        .await
        .map_err(|_| PeerError::Timeout("connecting"))??;

    state.send_replace(ConnectionState::Handshaking);
    debug!(%peer, "handshaking");
    let mine = Handshake::new(info_hash, config.peer_id);
    let theirs = timeout(config.handshake_timeout, handshake::exchange(&mut stream, &mine))
        .await
        .map_err(|_| PeerError::Timeout("handshaking"))??;
    Ok((stream, theirs))
}

/// Parses frames until the stream ends, a frame is malformed, or the
/// supervisor signals shutdown. The terminal error is forwarded as well.
async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_length: u32,
    frames: mpsc::Sender<Result<WireMessage, FrameError>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        // Shutting down the write half never wakes a read on the read half,
        // so the supervisor ends this loop through `shutdown` instead.
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_length) => frame,
            _ = &mut shutdown => return,
        };
        let terminal = frame.is_err();
        if frames.send(frame).await.is_err() || terminal {
            return;
        }
    }
}

enum Outcome {
    Stopped(Option<oneshot::Sender<()>>),
    RemoteClosed,
    Failed(PeerError),
}

struct Supervisor {
    peer: Peer,
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<Result<WireMessage, FrameError>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: watch::Sender<ConnectionState>,
    reader: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl Supervisor {
    async fn run(mut self) {
        let outcome = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        if let Err(e) = write_frame(&mut self.writer, &message).await {
                            break Outcome::Failed(PeerError::Transport(e));
                        }
                    },
                    Some(Command::Stop { respond_to }) => break Outcome::Stopped(Some(respond_to)),
                    None => break Outcome::Stopped(None),
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok(message)) => {
                        let _ = self.events.send(PeerEvent::Message { peer: self.peer.clone(), message });
                    },
                    Some(Err(FrameError::EndOfStream)) | None => break Outcome::RemoteClosed,
                    Some(Err(e)) => break Outcome::Failed(PeerError::Framing(e)),
                },
            }
        };
        self.finish(outcome).await;
    }

    async fn finish(self, outcome: Outcome) {
        let Supervisor { peer, mut writer, frames, commands, events, state, reader, shutdown } = self;
        state.send_replace(ConnectionState::Closing);
        drop(commands);

        if let Err(e) = writer.shutdown().await {
            debug!(%peer, error = %e, "error shutting down transport");
        }
        let _ = shutdown.send(());
        drop(frames);
        if let Err(e) = reader.await {
            warn!(%peer, error = %e, "read loop panicked");
        }
        drop(writer);

        match outcome {
            Outcome::Stopped(respond_to) => {
                info!(%peer, "connection stopped");
                state.send_replace(ConnectionState::Closed);
                let _ = events.send(PeerEvent::Closed { peer });
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(());
                }
            },
            Outcome::RemoteClosed => {
                info!(%peer, "peer closed the connection");
                state.send_replace(ConnectionState::Closed);
                let _ = events.send(PeerEvent::Closed { peer });
            },
            Outcome::Failed(error) => {
                warn!(%peer, %error, "connection failed");
                state.send_replace(ConnectionState::Failed);
                let _ = events.send(PeerEvent::Failed { peer, error });
            },
        }
    }
}
