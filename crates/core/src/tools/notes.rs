//! Note-taking tools.

use super::{Tool, ToolOutput};
use crate::error::ToolError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_SEARCH_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notebook: Send + Sync {
    async fn add_note(&self, title: String, body: String) -> Result<Note>;
    async fn search_notes(&self, query: String) -> Result<Vec<Note>>;
}

#[derive(Debug, Default)]
pub struct MemoryNotebook {
    notes: Mutex<Vec<Note>>,
}

#[async_trait]
impl Notebook for MemoryNotebook {
    async fn add_note(&self, title: String, body: String) -> Result<Note> {
        let mut notes = self.notes.lock().await;
        let note = Note {
            id: format!("n{}", notes.len() + 1),
            title,
            body,
            created_at: Utc::now(),
        };
        notes.push(note.clone());
        Ok(note)
    }

    async fn search_notes(&self, query: String) -> Result<Vec<Note>> {
        let notes = self.notes.lock().await;
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &Note)> = notes
            .iter()
            .filter_map(|n| {
                let haystack = format!("{} {}", n.title, n.body);
                matcher.fuzzy_match(&haystack, &query).map(|s| (s, n))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(MAX_SEARCH_RESULTS)
            .map(|(_, n)| n.clone())
            .collect())
    }
}

pub struct AddNote(pub Arc<dyn Notebook>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddNoteArgs {
    pub title: String,
    /// The note's content.
    pub body: String,
}

#[async_trait]
impl Tool for AddNote {
    const NAME: &'static str = "add_note";
    const DESCRIPTION: &'static str = "Saves a note for the user.";
    type Args = AddNoteArgs;

    async fn run(&self, args: AddNoteArgs) -> Result<ToolOutput, ToolError> {
        let note = self.0.add_note(args.title, args.body).await?;
        Ok(ToolOutput::text(format!("Saved note '{}'.", note.title)))
    }
}

pub struct SearchNotes(pub Arc<dyn Notebook>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchNotesArgs {
    /// Words to look for in note titles and bodies.
    pub query: String,
}

#[async_trait]
impl Tool for SearchNotes {
    const NAME: &'static str = "search_notes";
    const DESCRIPTION: &'static str = "Searches the user's notes.";
    type Args = SearchNotesArgs;

    async fn run(&self, args: SearchNotesArgs) -> Result<ToolOutput, ToolError> {
        let notes = self.0.search_notes(args.query.clone()).await?;
        if notes.is_empty() {
            return Ok(ToolOutput::text(format!("No notes match '{}'.", args.query)));
        }
        let lines: Vec<String> = notes
            .iter()
            .map(|n| format!("- {}: {}", n.title, n.body))
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_ranks_matching_notes() {
        let book = MemoryNotebook::default();
        book.add_note("Groceries".into(), "eggs, flour, butter".into()).await.unwrap();
        book.add_note("Wifi".into(), "password is on the router".into()).await.unwrap();

        let hits = book.search_notes("router".into()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Wifi");
    }

    #[tokio::test]
    async fn search_tool_reports_no_matches() {
        let tool = SearchNotes(Arc::new(MemoryNotebook::default()));
        let out = tool
            .run(SearchNotesArgs {
                query: "taxes".into(),
            })
            .await
            .unwrap();
        assert_eq!(out.text, "No notes match 'taxes'.");
    }
}
