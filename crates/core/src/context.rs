//! Builds the setup payload sent on every (re)connect.

use crate::generic_types::GenericSessionConfig;
use crate::store::{ConversationStore, UserRule};
use crate::tools::FunctionDeclaration;
use crate::transcript::{Author, TranscriptTurn, TurnKind};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fmt::Write;

/// How much of today's conversation is replayed into the instructions.
pub const MAX_CONTEXT_TURNS: usize = 40;

/// Used when no prompt file is configured or it cannot be read.
pub const DEFAULT_INSTRUCTIONS: &str = "You are Lumen, a friendly voice assistant. \
Keep answers short and conversational. Use the available tools to manage the user's \
tasks, calendar, notes, finances, timers and alarms. When the user says goodbye, call \
end_session.";

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    instructions: String,
    voice: Option<String>,
    tools: Vec<FunctionDeclaration>,
}

impl ContextBuilder {
    pub fn new(
        instructions: impl Into<String>,
        voice: Option<String>,
        tools: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            instructions: instructions.into(),
            voice,
            tools,
        }
    }

    /// Loads rules and the day's conversation from `store` and composes them.
    pub async fn build(
        &self,
        store: &dyn ConversationStore,
        today: NaiveDate,
    ) -> Result<GenericSessionConfig> {
        let rules = store
            .standing_rules()
            .await
            .context("Failed to load standing user rules")?;
        let turns = store
            .conversation_for_day(today)
            .await
            .context("Failed to load today's conversation")?;
        Ok(self.compose(&rules, &turns))
    }

    pub fn compose(&self, rules: &[UserRule], turns: &[TranscriptTurn]) -> GenericSessionConfig {
        let mut instructions = self.instructions.trim().to_string();

        if !rules.is_empty() {
            instructions.push_str("\n\nStanding instructions from the user:\n");
            for rule in rules {
                let _ = writeln!(instructions, "- {}", rule.text);
            }
        }

        let replay: Vec<&TranscriptTurn> = turns
            .iter()
            .filter(|t| t.kind != TurnKind::Error)
            .collect();
        let skip = replay.len().saturating_sub(MAX_CONTEXT_TURNS);
        if !replay.is_empty() {
            instructions.push_str("\n\nEarlier today you talked about:\n");
            for turn in &replay[skip..] {
                let who = match turn.author {
                    Author::User => "User",
                    Author::Assistant => "Assistant",
                };
                let _ = writeln!(instructions, "{who}: {}", turn.text);
            }
        }

        GenericSessionConfig {
            instructions: instructions.trim_end().to_string(),
            tools: self.tools.clone(),
            voice: self.voice.clone(),
        }
    }
}
