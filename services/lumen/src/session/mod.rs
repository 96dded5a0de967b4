//! Live session orchestration.
//!
//! One `SessionController` actor owns the connection, the audio devices, the
//! transcript and the retry state. Callers talk to it through a cloneable
//! [`SessionHandle`]; every request is a message on the actor's queue, so no
//! session state is shared.

mod controller;

pub use controller::SessionController;

use crate::audio::AudioBackend;
use lumen_core::SessionError;
use lumen_core::confirmation::PendingConfirmation;
use lumen_core::context::ContextBuilder;
use lumen_core::realtime_api::RealtimeApi;
use lumen_core::retry::RetryState;
use lumen_core::store::ConversationStore;
use lumen_core::tools::ToolDispatcher;
use lumen_core::tools::planner::Planner;
use lumen_core::transcript::TranscriptTurn;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    /// Waiting for a scheduled reconnect.
    Retrying,
    /// No usable audio host or device.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub retry: RetryState,
    pub assistant_speaking: bool,
    pub user_speaking: bool,
    /// Whether the microphone should be open while connected.
    pub listening: bool,
    /// Every reconnect tier has been used; only a manual connect clears it.
    pub reconnect_exhausted: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            retry: RetryState::default(),
            assistant_speaking: false,
            user_speaking: false,
            listening: true,
            reconnect_exhausted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Advisory text for the user (reconnect progress and the like).
    StatusMessage(String),
    /// An open turn grew, or a closed turn gained citations.
    TurnUpdated(TranscriptTurn),
    TurnClosed(TranscriptTurn),
    ToolInvoked { id: String, name: String },
    Error(String),
}

/// Everything the controller needs from the outside world.
pub struct SessionDeps {
    pub provider: Arc<dyn RealtimeApi>,
    pub audio: Arc<dyn AudioBackend>,
    pub store: Arc<dyn ConversationStore>,
    pub dispatcher: Arc<ToolDispatcher>,
    /// Used to resolve spoken reminder confirmations.
    pub planner: Arc<dyn Planner>,
    pub context: ContextBuilder,
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        intentional: bool,
        reply: oneshot::Sender<()>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SpeakReminder {
        subject: PendingConfirmation,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetListening {
        enabled: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Acquires audio devices and starts connecting. Returns once the devices
    /// are held; the handshake completes in the background.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { reply }, rx).await?
    }

    /// `intentional = false` is treated like a dropped connection and goes
    /// through the retry schedule. Resolves once the devices are released.
    pub async fn disconnect(&self, intentional: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Disconnect { intentional, reply }, rx)
            .await
    }

    pub async fn send_text_turn(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let text = text.into();
        self.request(Command::SendText { text, reply }, rx).await?
    }

    /// Has the assistant speak `text` and reads the user's next utterance as
    /// a yes/no answer about `subject`.
    pub async fn speak_reminder(
        &self,
        subject: PendingConfirmation,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let text = text.into();
        self.request(Command::SpeakReminder { subject, text, reply }, rx)
            .await?
    }

    pub async fn set_listening(&self, enabled: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetListening { enabled, reply }, rx)
            .await?
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        rx.await.map_err(|_| SessionError::ControllerClosed)
    }
}
