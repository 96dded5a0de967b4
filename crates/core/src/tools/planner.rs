//! Planner and calendar tools.

use super::{Tool, ToolOutput};
use crate::error::ToolError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub due: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    /// ISO-8601 local date-time, e.g. `2026-10-17T09:30`.
    pub starts_at: String,
    pub completed: bool,
}

/// Storage of planner tasks and calendar events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    async fn add_task(&self, title: String, due: Option<String>) -> Result<Task>;
    async fn list_tasks(&self, include_completed: bool) -> Result<Vec<Task>>;
    /// Marks the task matching `reference` (an id, or failing that the
    /// closest title) as completed.
    async fn complete_task(&self, reference: String) -> Result<Option<Task>>;
    async fn add_event(&self, title: String, starts_at: String) -> Result<Event>;
    async fn list_events(&self, day: Option<NaiveDate>) -> Result<Vec<Event>>;
    async fn complete_event(&self, reference: String) -> Result<Option<Event>>;
}

#[derive(Debug, Default)]
struct PlannerState {
    tasks: Vec<Task>,
    events: Vec<Event>,
    next_id: u64,
}

impl PlannerState {
    fn next_id(&mut self, prefix: char) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }
}

/// Picks the item whose id equals `reference`, else the best fuzzy title match.
fn resolve<'a, T>(items: &'a mut [T], reference: &str, id: fn(&T) -> &str, title: fn(&T) -> &str) -> Option<&'a mut T> {
    if let Some(idx) = items.iter().position(|i| id(i) == reference) {
        return items.get_mut(idx);
    }
    let matcher = SkimMatcherV2::default();
    let idx = items
        .iter()
        .enumerate()
        .filter_map(|(idx, i)| matcher.fuzzy_match(title(i), reference).map(|score| (idx, score)))
        .max_by_key(|(_, score)| *score)
        .map(|(idx, _)| idx)?;
    items.get_mut(idx)
}

#[derive(Debug, Default)]
pub struct MemoryPlanner {
    state: Mutex<PlannerState>,
}

#[async_trait]
impl Planner for MemoryPlanner {
    async fn add_task(&self, title: String, due: Option<String>) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = Task {
            id: state.next_id('t'),
            title,
            due,
            completed: false,
        };
        state.tasks.push(task.clone());
        Ok(task)
    }

    async fn list_tasks(&self, include_completed: bool) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| include_completed || !t.completed)
            .cloned()
            .collect())
    }

    async fn complete_task(&self, reference: String) -> Result<Option<Task>> {
        let mut state = self.state.lock().await;
        Ok(resolve(&mut state.tasks, &reference, |t| t.id.as_str(), |t| t.title.as_str()).map(|task| {
            task.completed = true;
            task.clone()
        }))
    }

    async fn add_event(&self, title: String, starts_at: String) -> Result<Event> {
        let mut state = self.state.lock().await;
        let event = Event {
            id: state.next_id('e'),
            title,
            starts_at,
            completed: false,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, day: Option<NaiveDate>) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        let prefix = day.map(|d| d.format("%Y-%m-%d").to_string());
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| prefix.as_deref().is_none_or(|p| e.starts_at.starts_with(p)))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.starts_at.cmp(&b.starts_at));
        Ok(events)
    }

    async fn complete_event(&self, reference: String) -> Result<Option<Event>> {
        let mut state = self.state.lock().await;
        Ok(resolve(&mut state.events, &reference, |e| e.id.as_str(), |e| e.title.as_str()).map(|event| {
            event.completed = true;
            event.clone()
        }))
    }
}

// --- Tools ---

pub struct AddTask(pub Arc<dyn Planner>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddTaskArgs {
    /// Short description of the task.
    pub title: String,
    /// Optional due date or date-time in ISO-8601 form.
    pub due: Option<String>,
}

#[async_trait]
impl Tool for AddTask {
    const NAME: &'static str = "add_task";
    const DESCRIPTION: &'static str = "Adds a task to the user's planner.";
    type Args = AddTaskArgs;

    async fn run(&self, args: AddTaskArgs) -> Result<ToolOutput, ToolError> {
        let task = self.0.add_task(args.title, args.due).await?;
        Ok(ToolOutput::text(match &task.due {
            Some(due) => format!("Added task '{}' (id {}) due {}.", task.title, task.id, due),
            None => format!("Added task '{}' (id {}).", task.title, task.id),
        }))
    }
}

pub struct ListTasks(pub Arc<dyn Planner>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTasksArgs {
    /// Include tasks that are already completed.
    #[serde(default)]
    pub include_completed: bool,
}

#[async_trait]
impl Tool for ListTasks {
    const NAME: &'static str = "list_tasks";
    const DESCRIPTION: &'static str = "Lists the user's planner tasks.";
    type Args = ListTasksArgs;

    async fn run(&self, args: ListTasksArgs) -> Result<ToolOutput, ToolError> {
        let tasks = self.0.list_tasks(args.include_completed).await?;
        if tasks.is_empty() {
            return Ok(ToolOutput::text("There are no tasks."));
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                let status = if t.completed { "done" } else { "open" };
                match &t.due {
                    Some(due) => format!("- [{}] {} ({status}, due {due})", t.id, t.title),
                    None => format!("- [{}] {} ({status})", t.id, t.title),
                }
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

pub struct CompleteTask(pub Arc<dyn Planner>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteTaskArgs {
    /// Task id, or words from its title.
    pub task: String,
}

#[async_trait]
impl Tool for CompleteTask {
    const NAME: &'static str = "complete_task";
    const DESCRIPTION: &'static str = "Marks a planner task as completed.";
    type Args = CompleteTaskArgs;

    async fn run(&self, args: CompleteTaskArgs) -> Result<ToolOutput, ToolError> {
        match self.0.complete_task(args.task.clone()).await? {
            Some(task) => Ok(ToolOutput::text(format!("Marked '{}' as done.", task.title))),
            None => Err(ToolError::NotFound(format!("Task '{}'", args.task))),
        }
    }
}

pub struct AddEvent(pub Arc<dyn Planner>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddEventArgs {
    /// What the event is.
    pub title: String,
    /// Start as ISO-8601 local date-time, e.g. 2026-10-17T09:30.
    pub starts_at: String,
}

#[async_trait]
impl Tool for AddEvent {
    const NAME: &'static str = "add_event";
    const DESCRIPTION: &'static str = "Adds an event to the user's calendar.";
    type Args = AddEventArgs;

    async fn run(&self, args: AddEventArgs) -> Result<ToolOutput, ToolError> {
        let event = self.0.add_event(args.title, args.starts_at).await?;
        Ok(ToolOutput::text(format!(
            "Scheduled '{}' at {} (id {}).",
            event.title, event.starts_at, event.id
        )))
    }
}

pub struct ListEvents(pub Arc<dyn Planner>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListEventsArgs {
    /// Restrict to one day, formatted YYYY-MM-DD.
    pub day: Option<String>,
}

#[async_trait]
impl Tool for ListEvents {
    const NAME: &'static str = "list_events";
    const DESCRIPTION: &'static str = "Lists calendar events, optionally for a single day.";
    type Args = ListEventsArgs;

    async fn run(&self, args: ListEventsArgs) -> Result<ToolOutput, ToolError> {
        let day = args
            .day
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| ToolError::InvalidArguments(format!("day: {e}")))?;
        let events = self.0.list_events(day).await?;
        if events.is_empty() {
            return Ok(ToolOutput::text("No events scheduled."));
        }
        let lines: Vec<String> = events
            .iter()
            .map(|e| format!("- [{}] {} at {}", e.id, e.title, e.starts_at))
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}
