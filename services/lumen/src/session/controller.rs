//! The session actor.
//!
//! Capture frames, provider events, tool completions, retry timers and caller
//! commands all arrive on channels and are handled one at a time by
//! [`SessionController::run`]. Nothing else writes session state.

use super::{Command, SessionDeps, SessionEvent, SessionHandle, SessionState, SessionStatus};
use crate::audio::{AudioBackend, AudioFrame, AudioPlaybackScheduler, CaptureHandle, DeviceError};
use crate::audio_utils::{CAPTURE_MIME_TYPE, encode_i16};
use lumen_core::SessionError;
use lumen_core::confirmation::{ConfirmationTracker, PendingConfirmation, SubjectKind};
use lumen_core::context::ContextBuilder;
use lumen_core::generic_types::{CloseReason, GenericClientEvent, GenericServerEvent};
use lumen_core::realtime_api::{RealtimeApi, RealtimeLink};
use lumen_core::retry::{MAX_CYCLES, RetryDecision, RetryPolicy};
use lumen_core::store::ConversationStore;
use lumen_core::tools::planner::Planner;
use lumen_core::tools::{SessionAction, ToolCallEnvelope, ToolDispatcher, ToolOutcome};
use lumen_core::transcript::{
    Author, MAX_RETAINED_TURNS, TranscriptAssembler, TranscriptTurn, TurnKind,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 32;
const INTERNAL_QUEUE: usize = 64;
const FRAME_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 256;
/// How often finished playback is reaped to refresh `assistant_speaking`.
const PLAYBACK_TICK: Duration = Duration::from_millis(250);

pub const RECONNECTING_MESSAGE: &str = "Connection lost. Reconnecting...";
pub const GAVE_UP_MESSAGE: &str = "Could not reconnect. Try connecting manually.";

/// Completions of work the controller spawned. Each carries the generation
/// of the connect attempt it belongs to.
enum Internal {
    Connected {
        generation: u64,
        result: Result<RealtimeLink, SessionError>,
    },
    RetryDue {
        generation: u64,
    },
    ToolFinished {
        generation: u64,
        outcome: ToolOutcome,
    },
}

enum PersistOp {
    Append(TranscriptTurn),
    Update(TranscriptTurn),
}

enum Wake {
    Command(Option<Command>),
    Internal(Internal),
    Remote(Option<GenericServerEvent>),
    Frame(AudioFrame),
    Tick,
}

/// Ids of turns already appended to the store, bounded like the assembler's
/// own history: a turn that has aged out there can no longer be updated.
#[derive(Default)]
struct PersistedTurns {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl PersistedTurns {
    /// Returns `true` the first time `id` is seen.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > MAX_RETAINED_TURNS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct ActiveLink {
    tx: mpsc::Sender<GenericClientEvent>,
    rx: mpsc::Receiver<GenericServerEvent>,
}

pub struct SessionController {
    provider: Arc<dyn RealtimeApi>,
    audio: Arc<dyn AudioBackend>,
    store: Arc<dyn ConversationStore>,
    dispatcher: Arc<ToolDispatcher>,
    planner: Arc<dyn Planner>,
    context: ContextBuilder,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    status_tx: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    persist_tx: mpsc::UnboundedSender<PersistOp>,

    state: SessionState,
    generation: u64,
    retry: RetryPolicy,
    reconnect_exhausted: bool,
    last_status_message: Option<String>,
    listening: bool,
    user_speaking: bool,

    link: Option<ActiveLink>,
    capture: Option<Box<dyn CaptureHandle>>,
    frames_rx: Option<mpsc::Receiver<AudioFrame>>,
    playback: Option<AudioPlaybackScheduler>,

    transcript: TranscriptAssembler,
    persisted: PersistedTurns,
    confirmations: ConfirmationTracker,
    /// Subject of a reminder sent but whose spoken turn has not completed.
    reminder_in_flight: Option<PendingConfirmation>,
    cancelled_calls: HashSet<String>,
}

impl SessionController {
    /// Starts the controller task and its transcript persister.
    pub fn spawn(deps: SessionDeps) -> SessionHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_persister(deps.store.clone(), persist_rx));

        let controller = SessionController {
            provider: deps.provider,
            audio: deps.audio,
            store: deps.store,
            dispatcher: deps.dispatcher,
            planner: deps.planner,
            context: deps.context,
            commands,
            internal_tx,
            internal_rx,
            status_tx,
            events: events.clone(),
            persist_tx,
            state: SessionState::Idle,
            generation: 0,
            retry: RetryPolicy::new(),
            reconnect_exhausted: false,
            last_status_message: None,
            listening: true,
            user_speaking: false,
            link: None,
            capture: None,
            frames_rx: None,
            playback: None,
            transcript: TranscriptAssembler::new(),
            persisted: PersistedTurns::default(),
            confirmations: ConfirmationTracker::new(),
            reminder_in_flight: None,
            cancelled_calls: HashSet::new(),
        };
        tokio::spawn(controller.run().instrument(info_span!("session_controller")));

        SessionHandle {
            commands: command_tx,
            status: status_rx,
            events,
        }
    }

    async fn run(mut self) {
        info!("Session controller started");
        let mut tick = tokio::time::interval(PLAYBACK_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some(msg) = self.internal_rx.recv() => Wake::Internal(msg),
                event = recv_from(self.link.as_mut().map(|l| &mut l.rx)) => Wake::Remote(event),
                Some(frame) = recv_from(self.frames_rx.as_mut()) => Wake::Frame(frame),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Command(None) => break,
                Wake::Internal(msg) => self.handle_internal(msg).await,
                Wake::Remote(Some(event)) => self.handle_remote(event).await,
                Wake::Remote(None) => {
                    self.handle_failure(SessionError::Transient(
                        "provider task ended unexpectedly".into(),
                    ));
                }
                Wake::Frame(frame) => self.handle_frame(frame),
                Wake::Tick => self.refresh_speaking(),
            }
        }

        self.retry.cancel_pending();
        self.release_devices();
        self.link = None;
        self.close_open_turns();
        info!("Session controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let result = self.manual_connect();
                let _ = reply.send(result);
            }
            Command::Disconnect { intentional, reply } => {
                if intentional {
                    self.intentional_disconnect(Some(reply));
                } else {
                    if matches!(self.state, SessionState::Connecting | SessionState::Streaming) {
                        self.handle_failure(SessionError::Transient("disconnected by caller".into()));
                    }
                    let _ = reply.send(());
                }
            }
            Command::SendText { text, reply } => {
                let result = self.send_text_turn(text).await;
                let _ = reply.send(result);
            }
            Command::SpeakReminder {
                subject,
                text,
                reply,
            } => {
                let result = self.speak_reminder(subject, text).await;
                let _ = reply.send(result);
            }
            Command::SetListening { enabled, reply } => {
                let result = self.set_listening(enabled);
                let _ = reply.send(result);
            }
        }
    }

    fn manual_connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Streaming => {
                debug!("Connect requested while already connected");
                Ok(())
            }
            SessionState::Idle | SessionState::Retrying | SessionState::Fatal => {
                self.retry.cancel_pending();
                self.retry.reset();
                self.reconnect_exhausted = false;
                self.last_status_message = None;
                self.begin_attempt()
            }
        }
    }

    /// Acquires devices, then hands the network connect to a background task.
    fn begin_attempt(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.acquire_devices() {
            let fatal = e.is_fatal();
            error!(error = %e, fatal, "Failed to acquire audio devices");
            self.state = if fatal {
                SessionState::Fatal
            } else {
                SessionState::Idle
            };
            self.surface_error(e.to_string());
            self.publish();
            return Err(SessionError::Device(e.to_string()));
        }

        self.generation += 1;
        self.cancelled_calls.clear();
        self.state = SessionState::Connecting;
        self.publish();

        let generation = self.generation;
        let provider = self.provider.clone();
        let store = self.store.clone();
        let context = self.context.clone();
        let internal = self.internal_tx.clone();
        info!(generation, "Connecting to realtime provider");
        tokio::spawn(async move {
            let today = chrono::Local::now().date_naive();
            let config = match context.build(store.as_ref(), today).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = ?e, "Failed to load conversation context, connecting without it");
                    context.compose(&[], &[])
                }
            };
            let result = provider.connect(config).await;
            let _ = internal.send(Internal::Connected { generation, result }).await;
        });
        Ok(())
    }

    fn acquire_devices(&mut self) -> Result<(), DeviceError> {
        if self.playback.is_none() {
            let sink = self.audio.start_playback()?;
            self.playback = Some(AudioPlaybackScheduler::new(sink));
        }
        if self.listening && self.capture.is_none() {
            if let Err(e) = self.start_capture() {
                if let Some(playback) = self.playback.take() {
                    playback.close();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), DeviceError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let handle = self.audio.start_capture(frames_tx)?;
        self.capture = Some(handle);
        self.frames_rx = Some(frames_rx);
        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames_rx = None;
        self.user_speaking = false;
    }

    /// Synchronous: both devices are closed when this returns.
    fn release_devices(&mut self) {
        self.stop_capture();
        if let Some(mut playback) = self.playback.take() {
            playback.interrupt();
            playback.close();
        }
    }

    fn intentional_disconnect(&mut self, reply: Option<oneshot::Sender<()>>) {
        info!(state = ?self.state, "Disconnecting");
        self.retry.cancel_pending();
        self.release_devices();
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        // Dropping the sender lets the provider task close the socket on its own.
        self.link = None;
        self.generation += 1;
        self.close_open_turns();
        // A reminder belongs to the session that spoke it.
        self.reminder_in_flight = None;
        self.confirmations.clear();
        self.state = SessionState::Idle;
        self.publish();
    }

    fn handle_failure(&mut self, err: SessionError) {
        warn!(error = %err, state = ?self.state, "Session connection failed");
        self.release_devices();
        self.link = None;
        self.close_open_turns();

        match err {
            SessionError::Authorization(_) => {
                self.retry.cancel_pending();
                self.retry.reset();
                self.state = SessionState::Idle;
                self.surface_error(err.to_string());
            }
            _ => match self.retry.on_failure() {
                RetryDecision::Retry {
                    attempt,
                    cycle,
                    delay,
                    cooldown,
                } => {
                    info!(attempt, cycle, ?delay, cooldown, "Scheduling reconnect");
                    self.state = SessionState::Retrying;
                    let message = if cooldown {
                        format!(
                            "Still unable to reconnect. Trying again in {} seconds (round {cycle} of {MAX_CYCLES}).",
                            delay.as_secs()
                        )
                    } else {
                        RECONNECTING_MESSAGE.to_string()
                    };
                    self.status_message(message);

                    let generation = self.generation;
                    let internal = self.internal_tx.clone();
                    self.retry.arm(delay, async move {
                        let _ = internal.send(Internal::RetryDue { generation }).await;
                    });
                }
                RetryDecision::GiveUp => {
                    warn!("Reconnect attempts exhausted");
                    self.state = SessionState::Idle;
                    self.reconnect_exhausted = true;
                    self.status_message(GAVE_UP_MESSAGE.to_string());
                }
            },
        }
        self.publish();
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { generation, result } => {
                if generation != self.generation || self.state != SessionState::Connecting {
                    debug!(generation, "Discarding stale connect result");
                    return;
                }
                match result {
                    Ok(link) => {
                        info!(generation, "Provider link open, waiting for handshake");
                        self.link = Some(ActiveLink {
                            tx: link.tx,
                            rx: link.rx,
                        });
                    }
                    Err(e) => self.handle_failure(e),
                }
            }
            Internal::RetryDue { generation } => {
                self.retry.take_fired();
                if generation != self.generation || self.state != SessionState::Retrying {
                    debug!(generation, "Ignoring stale reconnect timer");
                    return;
                }
                // Device errors are already surfaced as events.
                let _ = self.begin_attempt();
            }
            Internal::ToolFinished {
                generation,
                outcome,
            } => self.finish_tool_call(generation, outcome).await,
        }
    }

    async fn handle_remote(&mut self, event: GenericServerEvent) {
        match event {
            GenericServerEvent::Ready => {
                info!(generation = self.generation, "Session streaming");
                self.state = SessionState::Streaming;
                self.retry.on_success();
                self.reconnect_exhausted = false;
                self.last_status_message = None;
                self.publish();
            }
            GenericServerEvent::Audio {
                data,
                sample_rate,
                channels,
            } => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.enqueue(&data, sample_rate, channels);
                }
                self.publish();
            }
            GenericServerEvent::Interrupted => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt();
                }
                self.publish();
            }
            GenericServerEvent::InputTranscription(text) => {
                if let Some(turn) = self.transcript.push_delta(Author::User, &text) {
                    self.emit(SessionEvent::TurnUpdated(turn));
                }
            }
            GenericServerEvent::OutputTranscription(text) => {
                if let Some(turn) = self.transcript.push_delta(Author::Assistant, &text) {
                    self.emit(SessionEvent::TurnUpdated(turn));
                }
            }
            GenericServerEvent::TurnComplete { citations } => {
                let closed = self.transcript.complete_turn(citations);
                self.on_turns_closed(closed);
            }
            GenericServerEvent::Citations(citations) => {
                if let Some(turn) = self
                    .transcript
                    .merge_late_citations(Author::Assistant, &citations)
                {
                    self.persist(&turn);
                    self.emit(SessionEvent::TurnUpdated(turn));
                }
            }
            GenericServerEvent::ToolCall(calls) => {
                for call in calls {
                    self.start_tool_call(call);
                }
            }
            GenericServerEvent::ToolCallCancellation(ids) => {
                info!(?ids, "Remote cancelled tool calls");
                self.cancelled_calls.extend(ids);
            }
            GenericServerEvent::GoAway => {
                info!("Server announced it will close the connection soon");
            }
            GenericServerEvent::Error(message) => {
                warn!(%message, "Provider reported an error");
                self.surface_error(message);
            }
            GenericServerEvent::Closed(reason) => match reason {
                CloseReason::Intentional => {
                    debug!("Provider link closed on our request");
                    self.link = None;
                }
                CloseReason::Authorization(msg) => {
                    self.handle_failure(SessionError::Authorization(msg))
                }
                CloseReason::Transient(msg) => self.handle_failure(SessionError::Transient(msg)),
            },
        }
    }

    fn on_turns_closed(&mut self, closed: Vec<TranscriptTurn>) {
        let user_text = closed
            .iter()
            .rev()
            .find(|t| t.author == Author::User)
            .map(|t| t.text.clone());

        for turn in closed {
            self.persist(&turn);
            self.emit(SessionEvent::TurnClosed(turn));
        }

        if let Some(text) = user_text {
            if let Some(verdict) = self.confirmations.inspect(&text) {
                info!(subject = %verdict.subject.subject_id, answer = ?verdict.answer, "Reminder answered");
                if verdict.completes_subject() {
                    self.complete_subject(verdict.subject);
                }
            }
        }

        // The reminder itself has now been spoken; the next user turn answers it.
        if let Some(subject) = self.reminder_in_flight.take() {
            self.confirmations.arm(subject);
        }
    }

    fn complete_subject(&self, subject: PendingConfirmation) {
        let planner = self.planner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let id = subject.subject_id.clone();
            let completed = match subject.kind {
                SubjectKind::Task => planner
                    .complete_task(id.clone())
                    .await
                    .map(|t| t.map(|t| t.title)),
                SubjectKind::Event => planner
                    .complete_event(id.clone())
                    .await
                    .map(|e| e.map(|e| e.title)),
            };
            match completed {
                Ok(Some(title)) => {
                    let _ = events.send(SessionEvent::StatusMessage(format!(
                        "Marked {} '{title}' as done.",
                        subject.kind
                    )));
                }
                Ok(None) => warn!(kind = %subject.kind, %id, "Confirmed reminder subject no longer exists"),
                Err(e) => {
                    error!(kind = %subject.kind, %id, error = ?e, "Failed to complete reminder subject");
                    let _ = events.send(SessionEvent::Error(format!(
                        "Could not mark the {} as done.",
                        subject.kind
                    )));
                }
            }
        });
    }

    fn start_tool_call(&mut self, call: ToolCallEnvelope) {
        info!(tool = %call.name, id = %call.id, "Tool call received");
        self.emit(SessionEvent::ToolInvoked {
            id: call.id.clone(),
            name: call.name.clone(),
        });
        let generation = self.generation;
        let dispatcher = self.dispatcher.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.execute(call).await;
            let _ = internal
                .send(Internal::ToolFinished {
                    generation,
                    outcome,
                })
                .await;
        });
    }

    async fn finish_tool_call(&mut self, generation: u64, outcome: ToolOutcome) {
        let id = outcome.result.id.clone();
        if self.cancelled_calls.remove(&id) {
            info!(%id, "Dropping result of cancelled tool call");
            return;
        }
        if generation != self.generation {
            debug!(%id, generation, "Dropping tool result from an earlier connection");
            return;
        }
        let Some(link) = self.link.as_ref() else {
            debug!(%id, "Dropping tool result, no open link");
            return;
        };
        let response = GenericClientEvent::ToolResponse(vec![outcome.result]);
        if link.tx.send(response).await.is_err() {
            warn!(%id, "Provider link closed before the tool result was sent");
            return;
        }

        match outcome.action {
            Some(SessionAction::EndSession) => {
                info!("Ending session at the assistant's request");
                self.intentional_disconnect(None);
            }
            Some(SessionAction::StopListening) => {
                info!("Microphone turned off at the assistant's request");
                self.listening = false;
                self.stop_capture();
                self.publish();
            }
            None => {}
        }
    }

    fn handle_frame(&mut self, frame: AudioFrame) {
        if frame.voice_active != self.user_speaking {
            self.user_speaking = frame.voice_active;
            self.publish();
        }
        if self.state != SessionState::Streaming {
            return;
        }
        if let Some(link) = self.link.as_ref() {
            let event = GenericClientEvent::Audio {
                mime_type: CAPTURE_MIME_TYPE.to_string(),
                data: encode_i16(&frame.pcm),
            };
            if link.tx.try_send(event).is_err() {
                debug!("Outbound queue full, dropping audio frame");
            }
        }
    }

    async fn send_text_turn(&mut self, text: String) -> Result<(), SessionError> {
        let tx = self.streaming_link()?;
        tx.send(GenericClientEvent::Text(text.clone()))
            .await
            .map_err(|_| SessionError::NotConnected)?;
        let turn = self.transcript.record(Author::User, text, TurnKind::Message);
        self.persist(&turn);
        self.emit(SessionEvent::TurnClosed(turn));
        Ok(())
    }

    async fn speak_reminder(
        &mut self,
        subject: PendingConfirmation,
        text: String,
    ) -> Result<(), SessionError> {
        let tx = self.streaming_link()?;
        let prompt = format!(
            "Say this reminder to the user out loud, then ask whether it is done: {text}"
        );
        tx.send(GenericClientEvent::Text(prompt))
            .await
            .map_err(|_| SessionError::NotConnected)?;
        info!(kind = %subject.kind, id = %subject.subject_id, "Reminder sent");
        let turn = self.transcript.record(Author::Assistant, text, TurnKind::Alarm);
        self.persist(&turn);
        self.emit(SessionEvent::TurnClosed(turn));
        self.reminder_in_flight = Some(subject);
        Ok(())
    }

    fn set_listening(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.listening = enabled;
        let connected = matches!(self.state, SessionState::Connecting | SessionState::Streaming);
        let result = if !enabled {
            self.stop_capture();
            Ok(())
        } else if connected && self.capture.is_none() {
            self.start_capture().map_err(|e| {
                self.surface_error(e.to_string());
                SessionError::Device(e.to_string())
            })
        } else {
            Ok(())
        };
        self.publish();
        result
    }

    fn streaming_link(&self) -> Result<mpsc::Sender<GenericClientEvent>, SessionError> {
        match (&self.state, &self.link) {
            (SessionState::Streaming, Some(link)) => Ok(link.tx.clone()),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn close_open_turns(&mut self) {
        let closed = self.transcript.flush();
        for turn in closed {
            self.persist(&turn);
            self.emit(SessionEvent::TurnClosed(turn));
        }
    }

    /// Shows an error to the user and keeps it in the transcript.
    fn surface_error(&mut self, message: String) {
        let turn = self
            .transcript
            .record(Author::Assistant, message.clone(), TurnKind::Error);
        self.persist(&turn);
        self.emit(SessionEvent::Error(message));
    }

    /// Emits an advisory message unless it repeats the previous one.
    fn status_message(&mut self, message: String) {
        if self.last_status_message.as_deref() == Some(message.as_str()) {
            return;
        }
        self.last_status_message = Some(message.clone());
        self.emit(SessionEvent::StatusMessage(message));
    }

    fn persist(&mut self, turn: &TranscriptTurn) {
        let op = if self.persisted.insert(turn.id) {
            PersistOp::Append(turn.clone())
        } else {
            PersistOp::Update(turn.clone())
        };
        if self.persist_tx.send(op).is_err() {
            error!(turn = %turn.id, "Transcript persister is gone");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_speaking(&mut self) {
        if let Some(playback) = self.playback.as_mut() {
            playback.tick();
        }
        self.publish();
    }

    fn publish(&self) {
        let status = SessionStatus {
            state: self.state,
            retry: self.retry.state(),
            assistant_speaking: self.playback.as_ref().is_some_and(|p| p.is_speaking()),
            user_speaking: self.user_speaking,
            listening: self.listening,
            reconnect_exhausted: self.reconnect_exhausted,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn recv_from<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Applies store writes in order so an update never overtakes its append.
async fn run_persister(
    store: Arc<dyn ConversationStore>,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = ops.recv().await {
        let (action, id, result) = match &op {
            PersistOp::Append(turn) => ("append", turn.id, store.append_turn(turn).await),
            PersistOp::Update(turn) => ("update", turn.id, store.update_turn(turn).await),
        };
        if let Err(e) = result {
            error!(action, turn = %id, error = ?e, "Failed to persist transcript turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_turns_forget_the_oldest_ids() {
        let mut persisted = PersistedTurns::default();
        let first = Uuid::new_v4();
        assert!(persisted.insert(first));
        assert!(!persisted.insert(first));

        for _ in 0..MAX_RETAINED_TURNS {
            persisted.insert(Uuid::new_v4());
        }
        assert_eq!(persisted.ids.len(), MAX_RETAINED_TURNS);
        assert_eq!(persisted.order.len(), MAX_RETAINED_TURNS);
        assert!(persisted.insert(first), "evicted ids count as new again");
    }
}
