//! Provider-neutral events exchanged with a realtime voice endpoint.

use crate::tools::{FunctionDeclaration, ToolCallEnvelope, ToolResultEnvelope};
use crate::transcript::Citation;

/// Generic configuration for initializing a real-time session with any provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericSessionConfig {
    pub instructions: String,
    pub tools: Vec<FunctionDeclaration>,
    /// Prebuilt voice name, provider default when `None`.
    pub voice: Option<String>,
}

/// Events the application sends to the active provider task.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericClientEvent {
    /// One captured frame, already base64 encoded.
    Audio { mime_type: String, data: String },
    /// A typed user turn.
    Text(String),
    /// Replies for one or more tool calls.
    ToolResponse(Vec<ToolResultEnvelope>),
}

/// Why the provider task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We asked for it.
    Intentional,
    Authorization(String),
    Transient(String),
}

/// Generic events that any real-time provider can emit back to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericServerEvent {
    /// Handshake finished; the session is streaming.
    Ready,
    /// Decoded PCM from the assistant.
    Audio {
        data: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
    InputTranscription(String),
    OutputTranscription(String),
    /// The user barged in; pending assistant audio is stale.
    Interrupted,
    TurnComplete { citations: Vec<Citation> },
    /// Grounding sources that arrived outside a turn-complete message.
    Citations(Vec<Citation>),
    ToolCall(Vec<ToolCallEnvelope>),
    ToolCallCancellation(Vec<String>),
    /// The server announced it will close the connection soon.
    GoAway,
    /// An error from the provider that did not end the session.
    Error(String),
    /// The connection was closed. Always the last event.
    Closed(CloseReason),
}
