//! Per-connection session state and the live-session registry.

use crate::extract::StructuredProfile;
use crate::pipeline::messages::{ChatTurn, Speaker};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Lifecycle of the current turn within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// No turn in flight.
    #[default]
    Idle,
    /// Receiving audio from the client.
    Listening,
    /// Waiting on the recognizer for a final transcript.
    Recognizing,
    /// A response pipeline has been dispatched to the LLM.
    Dispatched,
    /// Synthesized audio is streaming back to the client.
    Streaming,
    /// The previous turn was cancelled by a newer final transcript.
    Interrupted,
}

/// State for one live voice session.
///
/// Owned by the session supervisor for the connection's lifetime; only
/// the dialogue controller and the currently owned response task mutate
/// it. History is append-only.
#[derive(Debug)]
pub struct Session {
    /// Unique session id.
    pub id: Uuid,
    /// Ordered conversation history.
    pub history: Vec<ChatTurn>,
    /// Structured applicant profile.
    pub profile: StructuredProfile,
    /// Current turn lifecycle state.
    pub turn_state: TurnState,
    /// Durable application record id, created lazily when document
    /// verification is first requested.
    pub application_id: Option<Uuid>,
    turn_counter: u64,
}

impl Session {
    /// Create a fresh session.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            history: Vec::new(),
            profile: StructuredProfile::default(),
            turn_state: TurnState::Idle,
            application_id: None,
            turn_counter: 0,
        }
    }

    /// Append a user utterance to the history.
    pub fn append_user(&mut self, text: &str) {
        self.history.push(ChatTurn {
            speaker: Speaker::User,
            text: text.to_owned(),
        });
    }

    /// Append an assistant reply to the history.
    pub fn append_assistant(&mut self, text: &str) {
        self.history.push(ChatTurn {
            speaker: Speaker::Assistant,
            text: text.to_owned(),
        });
    }

    /// Allocate the next turn ordinal.
    pub fn next_turn(&mut self) -> u64 {
        self.turn_counter += 1;
        self.turn_counter
    }
}

/// The in-flight unit of work for one turn's response pipeline.
///
/// Exclusively owned by the session supervisor. Cancelling is not
/// abandonment: the task is awaited so in-flight LLM/TTS calls are torn
/// down before a newer turn emits anything.
#[derive(Debug)]
pub struct PendingResponse {
    /// Turn ordinal this response belongs to.
    pub turn: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PendingResponse {
    /// Wrap a spawned response task.
    #[must_use]
    pub fn new(turn: u64, cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            turn,
            cancel,
            handle,
        }
    }

    /// Whether the task already ran to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the pipeline and wait for its teardown to finish.
    pub async fn cancel_and_wait(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Registry of live sessions, keyed by session id.
///
/// Scoped insert-on-connect / remove-on-disconnect; replaces the ambient
/// global connection maps the pattern usually degenerates into.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl SessionRegistry {
    /// Register a newly connected session with its root cancel token.
    pub fn register(&self, id: Uuid, cancel: CancellationToken) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, cancel);
            info!("session registered: {id} ({} live)", sessions.len());
        }
    }

    /// Remove a session on disconnect.
    pub fn remove(&self, id: Uuid) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
            info!("session removed: {id} ({} live)", sessions.len());
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every live session (server shutdown).
    pub fn shutdown_all(&self) {
        if let Ok(sessions) = self.sessions.lock() {
            for cancel in sessions.values() {
                cancel.cancel();
            }
        }
    }
}
