//! Realtime WebSocket client for the Gemini Live API.

use crate::types::{self, ClientMessage, ServerMessage};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use futures_util::{SinkExt, StreamExt};
use lumen_core::error::SessionError;
use lumen_core::generic_types::{
    CloseReason, GenericClientEvent, GenericServerEvent, GenericSessionConfig,
};
use lumen_core::realtime_api::{RealtimeApi, RealtimeLink};
use lumen_core::tools::ToolCallEnvelope;
use lumen_core::transcript::Citation;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument, warn};

pub const GEMINI_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Rate the service streams assistant audio at when the mime type omits it.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

#[derive(Debug, Clone)]
pub struct GeminiLiveClient {
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiLiveClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: GEMINI_LIVE_ENDPOINT.to_string(),
        }
    }

    /// Points the client at a different websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl RealtimeApi for GeminiLiveClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn connect(&self, config: GenericSessionConfig) -> Result<RealtimeLink, SessionError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (ws_stream, _) = connect_async(url).await.map_err(classify_connect_error)?;
        info!("Connected to Gemini Live WebSocket.");

        let setup = serde_json::to_string(&setup_message(&self.model, config))
            .map_err(|e| SessionError::Transient(format!("encoding setup: {e}")))?;
        let (mut sink, stream) = ws_stream.split();
        sink.send(WsMessage::Text(setup.into()))
            .await
            .map_err(classify_connect_error)?;

        let (client_tx, client_rx) = mpsc::channel(128);
        let (server_tx, server_rx) = mpsc::channel(256);
        let handle = tokio::spawn(run(sink, stream, client_rx, server_tx));

        Ok(RealtimeLink {
            tx: client_tx,
            rx: server_rx,
            handle,
        })
    }
}

fn setup_message(model: &str, config: GenericSessionConfig) -> ClientMessage {
    let speech_config = config.voice.map(|voice_name| types::SpeechConfig {
        voice_config: types::VoiceConfig {
            prebuilt_voice_config: types::PrebuiltVoiceConfig { voice_name },
        },
    });
    let system_instruction = (!config.instructions.is_empty()).then(|| types::Content {
        role: None,
        parts: vec![types::Part {
            text: config.instructions,
        }],
    });
    let tools = if config.tools.is_empty() {
        Vec::new()
    } else {
        vec![types::ToolSet {
            function_declarations: config
                .tools
                .into_iter()
                .map(|d| types::FunctionDeclaration {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                })
                .collect(),
        }]
    };
    ClientMessage::Setup(types::Setup {
        model: model.to_string(),
        generation_config: types::GenerationConfig {
            response_modalities: vec![types::ResponseModality::Audio],
            speech_config,
        },
        system_instruction,
        tools,
        input_audio_transcription: types::Empty {},
        output_audio_transcription: types::Empty {},
    })
}

fn encode_client_event(event: GenericClientEvent) -> ClientMessage {
    match event {
        GenericClientEvent::Audio { mime_type, data } => {
            ClientMessage::RealtimeInput(types::RealtimeInput {
                audio: types::Blob { mime_type, data },
            })
        }
        GenericClientEvent::Text(text) => ClientMessage::ClientContent(types::ClientContent {
            turns: vec![types::Content {
                role: Some("user".to_string()),
                parts: vec![types::Part { text }],
            }],
            turn_complete: true,
        }),
        GenericClientEvent::ToolResponse(results) => {
            ClientMessage::ToolResponse(types::ToolResponse {
                function_responses: results
                    .into_iter()
                    .map(|r| types::FunctionResponse {
                        id: r.id,
                        name: r.name,
                        response: types::FunctionResult { result: r.result },
                    })
                    .collect(),
            })
        }
    }
}

/// Maps one server message onto generic events, in delivery order.
fn translate(msg: ServerMessage) -> Vec<GenericServerEvent> {
    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(GenericServerEvent::Ready);
    }

    if let Some(content) = msg.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(GenericServerEvent::InputTranscription(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(GenericServerEvent::OutputTranscription(t.text));
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                events.push(decode_audio(&blob));
            } else if let Some(text) = part.text {
                debug!(%text, "Ignoring text part in audio response");
            }
        }
        if content.interrupted == Some(true) {
            events.push(GenericServerEvent::Interrupted);
        }
        let citations: Vec<Citation> = content
            .grounding_metadata
            .map(|g| g.grounding_chunks)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.web)
            .filter_map(|w| {
                w.uri.map(|uri| Citation {
                    uri,
                    title: w.title,
                })
            })
            .collect();
        if content.turn_complete == Some(true) {
            events.push(GenericServerEvent::TurnComplete { citations });
        } else if !citations.is_empty() {
            events.push(GenericServerEvent::Citations(citations));
        }
    }

    if let Some(call) = msg.tool_call {
        events.push(GenericServerEvent::ToolCall(
            call.function_calls
                .into_iter()
                .map(|f| ToolCallEnvelope {
                    id: f.id,
                    name: f.name,
                    args: f.args,
                })
                .collect(),
        ));
    }
    if let Some(cancel) = msg.tool_call_cancellation {
        events.push(GenericServerEvent::ToolCallCancellation(cancel.ids));
    }
    if msg.go_away.is_some() {
        events.push(GenericServerEvent::GoAway);
    }
    events
}

fn decode_audio(blob: &types::Blob) -> GenericServerEvent {
    match general_purpose::STANDARD.decode(&blob.data) {
        Ok(bytes) => GenericServerEvent::Audio {
            data: bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            sample_rate: types::sample_rate_of(&blob.mime_type).unwrap_or(DEFAULT_OUTPUT_SAMPLE_RATE),
            channels: 1,
        },
        Err(e) => GenericServerEvent::Error(format!("undecodable audio chunk: {e}")),
    }
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

fn classify_connect_error(e: WsError) -> SessionError {
    match e {
        WsError::Http(response) if is_auth_status(response.status().as_u16()) => {
            SessionError::Authorization(format!("HTTP {}", response.status()))
        }
        other => SessionError::Transient(other.to_string()),
    }
}

fn classify_close(frame: Option<CloseFrame<'_>>) -> CloseReason {
    let Some(frame) = frame else {
        return CloseReason::Transient("closed by server".into());
    };
    let reason = frame.reason.to_string();
    let lowered = reason.to_lowercase();
    if frame.code == CloseCode::Policy || lowered.contains("api key") || lowered.contains("permission") {
        CloseReason::Authorization(reason)
    } else {
        CloseReason::Transient(format!("closed by server ({}): {reason}", u16::from(frame.code)))
    }
}

/// Proxies events until either side closes. Always ends by emitting a
/// `Closed` event.
async fn run(
    mut sink: WsSink,
    mut stream: futures_util::stream::SplitStream<WsStream>,
    mut rx: mpsc::Receiver<GenericClientEvent>,
    events: mpsc::Sender<GenericServerEvent>,
) {
    let reason = loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else {
                    debug!("Client side dropped, closing Gemini socket.");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break CloseReason::Intentional;
                };
                if let Err(e) = send_event(&mut sink, event).await {
                    break CloseReason::Transient(e.to_string());
                }
            },
            inbound = stream.next() => {
                let text = match inbound {
                    Some(Ok(WsMessage::Text(text))) => text.to_string(),
                    // The service sends JSON in binary frames too.
                    Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(WsMessage::Close(frame))) => {
                        warn!(?frame, "Gemini WebSocket connection closed by server.");
                        break classify_close(frame);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "Error reading from Gemini WebSocket");
                        break CloseReason::Transient(e.to_string());
                    }
                    None => break CloseReason::Transient("connection ended without a close frame".into()),
                };
                let msg = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, raw = %text, "Unparseable Gemini message");
                        continue;
                    }
                };
                for event in translate(msg) {
                    if events.send(event).await.is_err() {
                        debug!("Event receiver dropped, flushing queued client events.");
                        flush_outbound(&mut sink, &mut rx).await;
                        return;
                    }
                }
            },
        }
    };
    let _ = events.send(GenericServerEvent::Closed(reason)).await;
}

async fn send_event(sink: &mut WsSink, event: GenericClientEvent) -> Result<(), WsError> {
    match serde_json::to_string(&encode_client_event(event)) {
        Ok(payload) => sink.send(WsMessage::Text(payload.into())).await,
        Err(e) => {
            error!(error = %e, "Failed to encode client event");
            Ok(())
        }
    }
}

/// Writes everything the caller queued before hanging up, then closes. A
/// tool response sent right before teardown must still reach the server.
async fn flush_outbound(sink: &mut WsSink, rx: &mut mpsc::Receiver<GenericClientEvent>) {
    rx.close();
    while let Some(event) = rx.recv().await {
        if let Err(e) = send_event(sink, event).await {
            warn!(error = %e, "Dropping queued client events, socket is gone");
            return;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}
