//! Conversation persistence boundary.
//!
//! The controller reads standing rules and today's conversation before every
//! (re)connect, appends turns as they close and rewrites a turn when late
//! citations merge into it.

use crate::transcript::TranscriptTurn;
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A standing instruction the user gave once and expects to be remembered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRule {
    pub id: Uuid,
    pub text: String,
}

impl UserRule {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn standing_rules(&self) -> Result<Vec<UserRule>>;
    /// Turns whose timestamp falls on the local calendar day `day`, oldest first.
    async fn conversation_for_day(&self, day: NaiveDate) -> Result<Vec<TranscriptTurn>>;
    async fn append_turn(&self, turn: &TranscriptTurn) -> Result<()>;
    /// Replaces a previously appended turn with the same id.
    async fn update_turn(&self, turn: &TranscriptTurn) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rules: RwLock<Vec<UserRule>>,
    turns: RwLock<Vec<TranscriptTurn>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<UserRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            turns: RwLock::default(),
        }
    }

    pub async fn add_rule(&self, text: impl Into<String>) -> UserRule {
        let rule = UserRule::new(text);
        self.rules.write().await.push(rule.clone());
        rule
    }

    pub async fn all_turns(&self) -> Vec<TranscriptTurn> {
        self.turns.read().await.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn standing_rules(&self) -> Result<Vec<UserRule>> {
        Ok(self.rules.read().await.clone())
    }

    async fn conversation_for_day(&self, day: NaiveDate) -> Result<Vec<TranscriptTurn>> {
        let mut turns: Vec<TranscriptTurn> = self
            .turns
            .read()
            .await
            .iter()
            .filter(|t| t.timestamp.with_timezone(&Local).date_naive() == day)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.timestamp);
        Ok(turns)
    }

    async fn append_turn(&self, turn: &TranscriptTurn) -> Result<()> {
        let mut turns = self.turns.write().await;
        if turns.iter().any(|t| t.id == turn.id) {
            bail!("turn {} was already appended", turn.id);
        }
        turns.push(turn.clone());
        Ok(())
    }

    async fn update_turn(&self, turn: &TranscriptTurn) -> Result<()> {
        let mut turns = self.turns.write().await;
        match turns.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => {
                *existing = turn.clone();
                Ok(())
            }
            None => bail!("turn {} does not exist", turn.id),
        }
    }
}
