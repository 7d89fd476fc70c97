//! WebSocket control sessions
//!
//! Each connection carries exactly one command: the first text frame. A
//! recognized command starts a sync run whose progress is forwarded line by
//! line; anything else gets a single `Invalid command.` line. The server
//! closes the connection once the run ends, and a client that disconnects
//! first cancels its run.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use proxbox_engine::ProgressEvent;
use proxbox_engine::SyncOrchestrator;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandSet};
use crate::handlers::AppState;

/// Maximum WebSocket message size (64KB); commands are a few bytes
pub const MAX_WS_MESSAGE_SIZE: usize = 65_536;

/// Maximum WebSocket frame size (16KB)
pub const MAX_WS_FRAME_SIZE: usize = 16_384;

/// Where a control session is in its life
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "command", rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, no command yet
    AwaitingCommand,
    /// A sync run is streaming
    Running(String),
    /// Command rejected
    Rejected,
    /// Connection is being closed
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::AwaitingCommand => f.write_str("awaiting command"),
            SessionState::Running(command) => write!(f, "running '{command}'"),
            SessionState::Rejected => f.write_str("rejected"),
            SessionState::Closing => f.write_str("closing"),
        }
    }
}

/// Snapshot of one open control session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Connection id, unique for the life of the process
    pub id: u64,
    /// Endpoint path
    pub endpoint: &'static str,
    /// Current state
    pub state: SessionState,
}

/// Registry of open control sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<u64, SessionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id
    pub async fn register(&self, endpoint: &'static str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id,
            SessionInfo {
                id,
                endpoint,
                state: SessionState::AwaitingCommand,
            },
        );
        info!("WebSocket connected: #{} on {} (active: {})", id, endpoint, sessions.len());
        id
    }

    /// Move a connection to a new state
    pub async fn transition(&self, id: u64, state: SessionState) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            debug!("WebSocket #{}: {} -> {}", id, session.state, state);
            session.state = state;
        }
    }

    /// Forget a connection
    pub async fn unregister(&self, id: u64) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        info!("WebSocket disconnected: #{} (active: {})", id, sessions.len());
    }

    /// Number of open connections
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Open connections, ordered by id
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// `GET /ws`: nodes, virtual machines or both
pub async fn sync_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, "/ws", CommandSet::All)
}

/// `GET /ws/virtual-machine`: virtual machines only
pub async fn vm_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, "/ws/virtual-machine", CommandSet::VirtualMachines)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, endpoint: &'static str, commands: CommandSet) -> Response {
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .max_frame_size(MAX_WS_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let id = state.sessions.register(endpoint).await;
            run_session(socket, &state.orchestrator, &state.sessions, id, commands).await;
            state.sessions.unregister(id).await;
        })
}

async fn run_session(
    socket: WebSocket,
    orchestrator: &SyncOrchestrator,
    sessions: &SessionRegistry,
    id: u64,
    commands: CommandSet,
) {
    let (mut sender, mut receiver) = socket.split();

    let text = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => {
                debug!("WebSocket #{} closed before sending a command", id);
                return;
            }
            Some(Err(e)) => {
                warn!("WebSocket #{} receive error: {}", id, e);
                return;
            }
            Some(Ok(_)) => continue,
        }
    };

    match commands.parse(&text) {
        Some(command) => {
            sessions.transition(id, SessionState::Running(command.to_string())).await;
            stream_run(&mut sender, &mut receiver, orchestrator, id, command).await;
        }
        None => {
            sessions.transition(id, SessionState::Rejected).await;
            info!("WebSocket #{} rejected command {:?}", id, text);
            if sender.send(Message::Text(ProgressEvent::InvalidCommand.to_string())).await.is_err() {
                return;
            }
        }
    }

    sessions.transition(id, SessionState::Closing).await;
    let _ = sender.send(Message::Close(None)).await;
}

async fn stream_run(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    orchestrator: &SyncOrchestrator,
    id: u64,
    command: Command,
) {
    info!("WebSocket #{} starting '{}'", id, command);
    let mut progress = orchestrator.spawn(command.scope());

    loop {
        tokio::select! {
            event = progress.next_event() => match event {
                Some(event) => {
                    if sender.send(Message::Text(event.to_string())).await.is_err() {
                        info!("WebSocket #{} send failed; cancelling run", id);
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("WebSocket #{} client left; cancelling run", id);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    progress.close();
}
