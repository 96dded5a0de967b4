//! Transcript Assembly
//!
//! Incremental transcription fragments arrive from two independent sources:
//! the local microphone (transcribed remotely) and the assistant's own voice.
//! This module folds them into `TranscriptTurn`s that stay open while deltas
//! keep arriving and become immutable once a turn boundary closes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed turns kept in memory for late citation merges and context rebuilds.
pub const MAX_RETAINED_TURNS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Assistant,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::User => write!(f, "user"),
            Author::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for Author {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Author::User),
            "assistant" => Ok(Author::Assistant),
            other => Err(format!("unknown author '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Message,
    Error,
    FileReference,
    Alarm,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnKind::Message => "message",
            TurnKind::Error => "error",
            TurnKind::FileReference => "file_reference",
            TurnKind::Alarm => "alarm",
        };
        f.write_str(s)
    }
}

impl FromStr for TurnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(TurnKind::Message),
            "error" => Ok(TurnKind::Error),
            "file_reference" => Ok(TurnKind::FileReference),
            "alarm" => Ok(TurnKind::Alarm),
            other => Err(format!("unknown turn kind '{other}'")),
        }
    }
}

/// A source the assistant grounded its answer on. Identity is the URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: String,
    pub title: Option<String>,
}

/// One contiguous span of speech or text attributed to a single author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub id: Uuid,
    pub author: Author,
    pub text: String,
    pub citations: Vec<Citation>,
    pub kind: TurnKind,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptTurn {
    pub fn new(author: Author, text: impl Into<String>, kind: TurnKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            text: text.into(),
            citations: Vec::new(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Adds citations not already present. Returns `true` if anything changed.
    pub fn merge_citations(&mut self, incoming: &[Citation]) -> bool {
        merge_unique(&mut self.citations, incoming)
    }
}

fn merge_unique(existing: &mut Vec<Citation>, incoming: &[Citation]) -> bool {
    let mut changed = false;
    for citation in incoming {
        if !existing.iter().any(|c| c.uri == citation.uri) {
            existing.push(citation.clone());
            changed = true;
        }
    }
    changed
}

#[derive(Debug)]
struct OpenTurn {
    id: Uuid,
    started_at: DateTime<Utc>,
    text: String,
}

impl OpenTurn {
    fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            text: String::new(),
        }
    }
}

/// Folds transcription deltas from both sides into turns.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    user: Option<OpenTurn>,
    assistant: Option<OpenTurn>,
    /// Citations that arrived while the assistant turn was still open.
    pending_citations: Vec<Citation>,
    closed: Vec<TranscriptTurn>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment to the author's open turn, opening a new turn when
    /// the accumulator is empty. Returns a snapshot of the open turn.
    pub fn push_delta(&mut self, author: Author, fragment: &str) -> Option<TranscriptTurn> {
        if fragment.is_empty() {
            return None;
        }
        let slot = match author {
            Author::User => &mut self.user,
            Author::Assistant => &mut self.assistant,
        };
        let open = slot.get_or_insert_with(OpenTurn::start);
        open.text.push_str(fragment);
        Some(TranscriptTurn {
            id: open.id,
            author,
            text: open.text.clone(),
            citations: Vec::new(),
            kind: TurnKind::Message,
            timestamp: open.started_at,
        })
    }

    /// Current text of the author's open turn, if any.
    pub fn open_text(&self, author: Author) -> Option<&str> {
        match author {
            Author::User => self.user.as_ref(),
            Author::Assistant => self.assistant.as_ref(),
        }
        .map(|t| t.text.as_str())
    }

    /// Closes both open turns at a turn boundary and clears the accumulators.
    ///
    /// The user turn (if any) closes before the assistant turn. Citations go to
    /// the assistant turn; if no assistant turn was open they are merged into
    /// the latest closed assistant turn instead.
    pub fn complete_turn(&mut self, citations: Vec<Citation>) -> Vec<TranscriptTurn> {
        let mut closed = Vec::with_capacity(2);

        if let Some(turn) = self.close(Author::User) {
            closed.push(turn);
        }

        let mut assistant_citations = std::mem::take(&mut self.pending_citations);
        merge_unique(&mut assistant_citations, &citations);
        match self.assistant.take() {
            Some(open) if !open.text.trim().is_empty() => {
                let mut turn = closed_turn(Author::Assistant, open);
                turn.citations = assistant_citations;
                self.retain(turn.clone());
                closed.push(turn);
            }
            _ => {
                if !assistant_citations.is_empty() {
                    // Nothing open to attach to; fall back to the late-merge path.
                    if let Some(turn) = self.merge_into_latest(Author::Assistant, &assistant_citations) {
                        closed.push(turn);
                    }
                }
            }
        }
        closed
    }

    /// Merges citations that arrived outside a turn-complete event.
    ///
    /// While the assistant turn is open they are held until it closes and
    /// `None` is returned. Otherwise they merge into the most recent closed
    /// turn of `author`, and the updated turn is returned if it changed.
    pub fn merge_late_citations(
        &mut self,
        author: Author,
        citations: &[Citation],
    ) -> Option<TranscriptTurn> {
        if author == Author::Assistant && self.assistant.is_some() {
            merge_unique(&mut self.pending_citations, citations);
            return None;
        }
        self.merge_into_latest(author, citations)
    }

    /// Records a complete turn that did not come from transcription (typed
    /// text, surfaced errors, alarms).
    pub fn record(&mut self, author: Author, text: impl Into<String>, kind: TurnKind) -> TranscriptTurn {
        let turn = TranscriptTurn::new(author, text, kind);
        self.retain(turn.clone());
        turn
    }

    /// Closes whatever is open, e.g. when the connection drops mid-turn.
    pub fn flush(&mut self) -> Vec<TranscriptTurn> {
        self.complete_turn(Vec::new())
    }

    pub fn turns(&self) -> &[TranscriptTurn] {
        &self.closed
    }

    fn close(&mut self, author: Author) -> Option<TranscriptTurn> {
        let slot = match author {
            Author::User => &mut self.user,
            Author::Assistant => &mut self.assistant,
        };
        let open = slot.take()?;
        if open.text.trim().is_empty() {
            return None;
        }
        let turn = closed_turn(author, open);
        self.retain(turn.clone());
        Some(turn)
    }

    fn merge_into_latest(&mut self, author: Author, citations: &[Citation]) -> Option<TranscriptTurn> {
        let turn = self.closed.iter_mut().rev().find(|t| t.author == author)?;
        turn.merge_citations(citations).then(|| turn.clone())
    }

    fn retain(&mut self, turn: TranscriptTurn) {
        self.closed.push(turn);
        if self.closed.len() > MAX_RETAINED_TURNS {
            let excess = self.closed.len() - MAX_RETAINED_TURNS;
            self.closed.drain(..excess);
        }
    }
}

fn closed_turn(author: Author, open: OpenTurn) -> TranscriptTurn {
    TranscriptTurn {
        id: open.id,
        author,
        text: open.text.trim().to_string(),
        citations: Vec::new(),
        kind: TurnKind::Message,
        timestamp: open.started_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite(uri: &str) -> Citation {
        Citation {
            uri: uri.to_string(),
            title: None,
        }
    }

    #[test]
    fn deltas_before_boundary_form_one_turn() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::User, "hello");
        t.push_delta(Author::User, " world");
        let closed = t.complete_turn(vec![]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].text, "hello world");
        assert_eq!(closed[0].author, Author::User);
    }

    #[test]
    fn boundary_starts_a_separate_turn() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::User, "hello");
        let first = t.complete_turn(vec![]);
        t.push_delta(Author::User, "next");
        let second = t.complete_turn(vec![]);
        assert_eq!(second[0].text, "next");
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(t.turns().len(), 2);
    }

    #[test]
    fn open_turn_keeps_its_id_while_growing() {
        let mut t = TranscriptAssembler::new();
        let a = t.push_delta(Author::Assistant, "Sure,").unwrap();
        let b = t.push_delta(Author::Assistant, " done.").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.text, "Sure, done.");
        assert_eq!(t.open_text(Author::Assistant), Some("Sure, done."));
    }

    #[test]
    fn completion_closes_user_before_assistant_and_clears_both() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::User, "what's on today?");
        t.push_delta(Author::Assistant, "Two meetings.");
        let closed = t.complete_turn(vec![]);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].author, Author::User);
        assert_eq!(closed[1].author, Author::Assistant);
        assert!(t.open_text(Author::User).is_none());
        assert!(t.open_text(Author::Assistant).is_none());
    }

    #[test]
    fn whitespace_only_turns_are_dropped() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::User, "  ");
        assert!(t.complete_turn(vec![]).is_empty());
        assert!(t.push_delta(Author::User, "").is_none());
    }

    #[test]
    fn citations_attach_to_the_assistant_turn() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::Assistant, "It will rain.");
        let closed = t.complete_turn(vec![cite("https://weather.example")]);
        assert_eq!(closed[0].citations, vec![cite("https://weather.example")]);
    }

    #[test]
    fn late_citations_merge_into_latest_turn_without_duplicates() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::Assistant, "first answer");
        t.complete_turn(vec![cite("a")]);
        t.push_delta(Author::Assistant, "second answer");
        t.complete_turn(vec![]);

        let updated = t.merge_late_citations(Author::Assistant, &[cite("a"), cite("b")]).unwrap();
        assert_eq!(updated.text, "second answer");
        assert_eq!(updated.citations, vec![cite("a"), cite("b")]);

        assert!(t.merge_late_citations(Author::Assistant, &[cite("b")]).is_none());
        assert_eq!(t.turns()[0].citations, vec![cite("a")]);
    }

    #[test]
    fn citations_during_open_turn_are_held_until_close() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::Assistant, "Here is");
        assert!(t.merge_late_citations(Author::Assistant, &[cite("x")]).is_none());
        t.push_delta(Author::Assistant, " the news.");
        let closed = t.complete_turn(vec![cite("x"), cite("y")]);
        assert_eq!(closed[0].citations, vec![cite("x"), cite("y")]);
    }

    #[test]
    fn citations_without_open_turn_update_previous_turn() {
        let mut t = TranscriptAssembler::new();
        t.push_delta(Author::Assistant, "answer");
        t.complete_turn(vec![]);
        let closed = t.complete_turn(vec![cite("late")]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].text, "answer");
        assert_eq!(closed[0].citations, vec![cite("late")]);
    }

    #[test]
    fn recorded_turns_are_closed_immediately() {
        let mut t = TranscriptAssembler::new();
        let turn = t.record(Author::Assistant, "Connection lost", TurnKind::Error);
        assert_eq!(t.turns().last().map(|t| t.id), Some(turn.id));
        assert_eq!(turn.kind, TurnKind::Error);
    }

    #[test]
    fn author_and_kind_round_trip_through_strings() {
        for kind in [TurnKind::Message, TurnKind::Error, TurnKind::FileReference, TurnKind::Alarm] {
            assert_eq!(kind.to_string().parse::<TurnKind>().unwrap(), kind);
        }
        assert_eq!("assistant".parse::<Author>().unwrap(), Author::Assistant);
        assert!("robot".parse::<Author>().is_err());
    }
}
