//! Per-session IPC over a local Unix socket.
//!
//! Each session exposes one listening socket inside its directory. Multiple
//! clients may connect concurrently; each connection runs an independent
//! incremental frame parser. Stdin frames are serialized onto the session's
//! single input queue via the session dispatcher, control frames execute
//! the same logic as the direct API, status updates are cached and
//! rebroadcast to every other client, heartbeats are echoed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ttyhub_core::{
    encode_frame, ControlCommand, ErrorPayload, Frame, FrameDecoder, FrameType, HubError,
    HubResult, StatusUpdate,
};

/// Work item handed from IPC connections to the session's dispatcher.
#[derive(Debug)]
pub enum SessionCommand {
    /// Raw stdin bytes for the input queue.
    Stdin(Vec<u8>),
    /// A control command, executed exactly like the direct API.
    Control(ControlCommand),
    /// A parsed status update from an attached reporter.
    Status(StatusUpdate),
}

type ClientMap = Arc<Mutex<HashMap<u64, UnboundedSender<Vec<u8>>>>>;

/// Handle on a session's socket listener.
pub struct SessionIpc {
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
    clients: ClientMap,
}

impl SessionIpc {
    /// Bind the session socket and start accepting clients. Frames are
    /// dispatched onto `commands`; the cached status update is replayed to
    /// newly connecting clients.
    pub fn spawn(
        socket_path: PathBuf,
        session_id: String,
        commands: UnboundedSender<SessionCommand>,
    ) -> HubResult<Self> {
        // A stale socket from a previous run blocks bind.
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let cached_status: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let next_client = Arc::new(AtomicU64::new(1));

        let accept_clients = Arc::clone(&clients);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "IPC accept failed");
                        break;
                    }
                };
                let client_id = next_client.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session_id, client_id, "IPC client connected");
                tokio::spawn(run_connection(
                    stream,
                    client_id,
                    session_id.clone(),
                    commands.clone(),
                    Arc::clone(&accept_clients),
                    Arc::clone(&cached_status),
                ));
            }
        });

        Ok(Self {
            socket_path,
            accept_task,
            clients,
        })
    }

    /// Stop accepting, drop all client connections, remove the socket file.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn run_connection(
    stream: UnixStream,
    client_id: u64,
    session_id: String,
    commands: UnboundedSender<SessionCommand>,
    clients: ClientMap,
    cached_status: Arc<Mutex<Option<Vec<u8>>>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    // Outbound frames for this client flow through their own queue so the
    // read loop never blocks on a slow peer.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    // Replay the cached status update to the newcomer.
    {
        let cached = cached_status.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(payload) = cached.as_ref() {
            let _ = out_tx.send(encode_frame(FrameType::StatusUpdate, payload));
        }
    }
    clients
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(client_id, out_tx.clone());

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(session_id = %session_id, client_id, error = %e, "IPC protocol error");
                let payload = ErrorPayload::from_error(&e);
                if let Ok(json) = serde_json::to_vec(&payload) {
                    let _ = out_tx.send(encode_frame(FrameType::Error, &json));
                }
                break;
            }
        };
        for frame in frames {
            handle_frame(
                frame,
                client_id,
                &session_id,
                &commands,
                &clients,
                &cached_status,
                &out_tx,
            );
        }
    }

    clients
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&client_id);
    drop(out_tx);
    let _ = writer_task.await;
    debug!(session_id = %session_id, client_id, "IPC client disconnected");
}

fn handle_frame(
    frame: Frame,
    client_id: u64,
    session_id: &str,
    commands: &UnboundedSender<SessionCommand>,
    clients: &ClientMap,
    cached_status: &Arc<Mutex<Option<Vec<u8>>>>,
    out_tx: &UnboundedSender<Vec<u8>>,
) {
    match frame.frame_type() {
        Some(FrameType::Stdin) => {
            let _ = commands.send(SessionCommand::Stdin(frame.payload));
        }
        Some(FrameType::Control) => match ControlCommand::from_json(&frame.payload) {
            Ok(cmd) => {
                let _ = commands.send(SessionCommand::Control(cmd));
            }
            Err(e) => {
                warn!(session_id, client_id, error = %e, "bad control payload");
                let payload = ErrorPayload::from_error(&e);
                if let Ok(json) = serde_json::to_vec(&payload) {
                    let _ = out_tx.send(encode_frame(FrameType::Error, &json));
                }
            }
        },
        Some(FrameType::StatusUpdate) => {
            match serde_json::from_slice::<StatusUpdate>(&frame.payload) {
                Ok(update) => {
                    *cached_status.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(frame.payload.clone());
                    // Fan out to every other connected client.
                    let encoded = encode_frame(FrameType::StatusUpdate, &frame.payload);
                    let peers = clients.lock().unwrap_or_else(|e| e.into_inner());
                    for (&peer_id, peer) in peers.iter() {
                        if peer_id != client_id {
                            let _ = peer.send(encoded.clone());
                        }
                    }
                    drop(peers);
                    let _ = commands.send(SessionCommand::Status(update));
                }
                Err(e) => {
                    warn!(session_id, client_id, error = %e, "bad status payload");
                }
            }
        }
        Some(FrameType::Heartbeat) => {
            let _ = out_tx.send(encode_frame(FrameType::Heartbeat, b""));
        }
        Some(FrameType::Error) => {
            warn!(
                session_id,
                client_id,
                payload = %String::from_utf8_lossy(&frame.payload),
                "error frame from IPC client"
            );
        }
        Some(FrameType::StdoutSubscribe) | Some(FrameType::Metrics) => {
            debug!(session_id, client_id, ty = frame.ty, "reserved frame type ignored");
        }
        None => {
            warn!(session_id, client_id, ty = frame.ty, "unknown frame type ignored");
        }
    }
}

/// Client side of the session socket, used to reach sessions owned by
/// another process (e.g. a forwarder's session, controlled by the server).
pub struct IpcClient {
    stream: UnixStream,
    decoder: FrameDecoder,
    ready: std::collections::VecDeque<Frame>,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path, session_id: &str) -> HubResult<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|_| HubError::NoSocketConnection(session_id.to_string()))?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            ready: std::collections::VecDeque::new(),
        })
    }

    pub async fn send_stdin(&mut self, data: &[u8]) -> HubResult<()> {
        self.send(FrameType::Stdin, data).await
    }

    pub async fn send_control(&mut self, cmd: &ControlCommand) -> HubResult<()> {
        let payload = cmd.to_json()?;
        self.send(FrameType::Control, &payload).await
    }

    pub async fn send_status(&mut self, update: &StatusUpdate) -> HubResult<()> {
        let payload =
            serde_json::to_vec(update).map_err(|e| HubError::Protocol(e.to_string()))?;
        self.send(FrameType::StatusUpdate, &payload).await
    }

    pub async fn send_heartbeat(&mut self) -> HubResult<()> {
        self.send(FrameType::Heartbeat, b"").await
    }

    /// Read the next complete frame, waiting for more bytes as needed.
    pub async fn recv_frame(&mut self) -> HubResult<Frame> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(HubError::Protocol("IPC connection closed".into()));
            }
            self.ready.extend(self.decoder.feed(&buf[..n])?);
        }
    }

    async fn send(&mut self, ty: FrameType, payload: &[u8]) -> HubResult<()> {
        let frame = encode_frame(ty, payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}
