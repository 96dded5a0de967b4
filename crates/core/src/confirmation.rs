//! Spoken reminder confirmation.
//!
//! After a reminder for a task or event has been spoken, the next completed
//! user utterance is read once as a yes/no answer. The slot is single-use:
//! it is cleared on inspection whatever the answer was.

use serde::{Deserialize, Serialize};
use std::fmt;

const AFFIRMATIVE: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "done", "did", "finished", "completed", "complete",
    "ok", "okay", "да", "ага", "угу", "конечно", "сделал", "сделала", "сделано", "готово",
    "выполнил", "выполнила", "закончил", "закончила",
];

const NEGATIVE: &[&str] = &[
    "no", "nope", "not", "didn't", "didnt", "haven't", "havent", "don't", "dont", "never",
    "нет", "не", "неа", "ещё", "еще",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Task,
    Event,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::Task => write!(f, "task"),
            SubjectKind::Event => write!(f, "event"),
        }
    }
}

/// The planner item a just-spoken reminder was about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub kind: SubjectKind,
    pub subject_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Affirmative,
    Negative,
    /// Both or neither keyword set matched.
    Unclear,
}

/// Outcome of inspecting a user turn against the pending slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub subject: PendingConfirmation,
    pub answer: Answer,
}

impl Verdict {
    /// Only an unambiguous yes completes the subject.
    pub fn completes_subject(&self) -> bool {
        self.answer == Answer::Affirmative
    }
}

#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    pending: Option<PendingConfirmation>,
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the slot, replacing anything already pending.
    pub fn arm(&mut self, subject: PendingConfirmation) {
        self.pending = Some(subject);
    }

    pub fn pending(&self) -> Option<&PendingConfirmation> {
        self.pending.as_ref()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Reads `user_text` as the answer and clears the slot unconditionally.
    pub fn inspect(&mut self, user_text: &str) -> Option<Verdict> {
        let subject = self.pending.take()?;
        Some(Verdict {
            subject,
            answer: classify(user_text),
        })
    }
}

/// Case-insensitive keyword classification. Mixed signals ("не сделал",
/// "yes, not yet") are `Unclear` rather than guessed.
pub fn classify(text: &str) -> Answer {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .collect();
    let yes = tokens.iter().any(|t| AFFIRMATIVE.contains(t));
    let no = tokens.iter().any(|t| NEGATIVE.contains(t));
    match (yes, no) {
        (true, false) => Answer::Affirmative,
        (false, true) => Answer::Negative,
        _ => Answer::Unclear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> PendingConfirmation {
        PendingConfirmation {
            kind: SubjectKind::Task,
            subject_id: id.to_string(),
        }
    }

    #[test]
    fn classifies_plain_answers() {
        assert_eq!(classify("Yes, I did it"), Answer::Affirmative);
        assert_eq!(classify("ДА, готово"), Answer::Affirmative);
        assert_eq!(classify("no"), Answer::Negative);
        assert_eq!(classify("Nope, I didn't get to it"), Answer::Negative);
        assert_eq!(classify("what's the weather"), Answer::Unclear);
    }

    #[test]
    fn mixed_signals_are_unclear() {
        assert_eq!(classify("не сделал"), Answer::Unclear);
        assert_eq!(classify("yes but not yet"), Answer::Unclear);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        // "know" must not count as "no"; "nothing" must not count as "not".
        assert_eq!(classify("I know, done"), Answer::Affirmative);
        assert_eq!(classify("nothing else"), Answer::Unclear);
    }

    #[test]
    fn slot_clears_after_exactly_one_inspection() {
        for text in ["yes", "no", "tell me a joke"] {
            let mut tracker = ConfirmationTracker::new();
            tracker.arm(task("t1"));
            let verdict = tracker.inspect(text).expect("pending slot");
            assert_eq!(verdict.subject, task("t1"));
            assert!(tracker.pending().is_none());
            assert!(tracker.inspect("yes").is_none());
        }
    }

    #[test]
    fn only_affirmative_completes() {
        let mut tracker = ConfirmationTracker::new();
        tracker.arm(task("t1"));
        assert!(tracker.inspect("yep").unwrap().completes_subject());
        tracker.arm(task("t2"));
        assert!(!tracker.inspect("не сделал").unwrap().completes_subject());
    }

    #[test]
    fn arming_replaces_previous_subject() {
        let mut tracker = ConfirmationTracker::new();
        tracker.arm(task("old"));
        tracker.arm(PendingConfirmation {
            kind: SubjectKind::Event,
            subject_id: "e9".into(),
        });
        assert_eq!(tracker.pending().unwrap().subject_id, "e9");
    }
}
