//! Remote Tool Dispatch
//!
//! The remote model issues named function calls during a live session. Each
//! name is registered against a typed handler; the dispatcher routes the call,
//! formats the outcome as text, and guarantees exactly one result per
//! invocation id no matter how the handler behaves.
//!
//! Handlers hold no domain logic of their own: each one forwards to a single
//! collaborator operation (planner, notebook, ledger, alarm clock) and formats
//! the answer for speech.

pub mod alarms;
pub mod finance;
pub mod notes;
pub mod planner;
pub mod session;

use crate::error::ToolError;
use async_trait::async_trait;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A function call issued by the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The single reply owed for a `ToolCallEnvelope`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// Function metadata advertised to the remote model at session setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Side effects on the live session itself. These run only after the
/// result has been sent back over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    EndSession,
    StopListening,
}

/// Successful handler output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub action: Option<SessionAction>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: SessionAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Everything the controller needs after a call: the reply and any deferred
/// session action.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: ToolResultEnvelope,
    pub action: Option<SessionAction>,
}

/// Object-safe handler interface stored in the registry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn declaration(&self) -> FunctionDeclaration;
    async fn call(&self, args: Map<String, Value>) -> Result<ToolOutput, ToolError>;
}

/// A handler with typed arguments. Implementors get `ToolHandler` for free,
/// including argument decoding and a JSON schema derived from `Args`.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    type Args: DeserializeOwned + JsonSchema + Send;

    async fn run(&self, args: Self::Args) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: T::NAME.to_string(),
            description: T::DESCRIPTION.to_string(),
            parameters: parameters_schema::<T::Args>(),
        }
    }

    async fn call(&self, args: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let args: T::Args = serde_json::from_value(Value::Object(args))
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        self.run(args).await
    }
}

/// Arguments for tools that take none.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// JSON schema for `A`, stripped of the keys the live API rejects.
pub fn parameters_schema<A: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schemars::schema_for!(A)).unwrap_or(Value::Null);
    strip_schema_metadata(&mut value);
    value
}

fn strip_schema_metadata(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    map.remove("$schema");
    map.remove("title");
    map.remove("additionalProperties");
    map.remove("format");

    // `["string", "null"]` becomes `"string"` plus `nullable`.
    if let Some(Value::Array(types)) = map.get("type") {
        let concrete: Vec<Value> = types.iter().filter(|t| *t != "null").cloned().collect();
        if concrete.len() == 1 {
            let nullable = concrete.len() != types.len();
            map.insert("type".into(), concrete[0].clone());
            if nullable {
                map.insert("nullable".into(), Value::Bool(true));
            }
        }
    }

    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for prop in props.values_mut() {
            strip_schema_metadata(prop);
        }
    }
    if let Some(items) = map.get_mut("items") {
        strip_schema_metadata(items);
    }
}

/// Name → handler registry.
#[derive(Default)]
pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its own name, replacing any previous one.
    pub fn register<H: ToolHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(tool = %name, "Replaced an already registered tool handler");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Declarations for every registered tool, sorted by name.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        let mut decls: Vec<_> = self.handlers.values().map(|h| h.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Runs one invocation. Never fails: unknown names, handler errors and
    /// handler panics all become result text with the caller's invocation id.
    pub async fn execute(&self, envelope: ToolCallEnvelope) -> ToolOutcome {
        let ToolCallEnvelope { id, name, args } = envelope;
        let Some(handler) = self.handlers.get(&name).cloned() else {
            warn!(tool = %name, %id, "Remote model called an unknown function");
            return ToolOutcome {
                result: ToolResultEnvelope {
                    id,
                    result: format!("Error: unknown function '{name}'."),
                    name,
                },
                action: None,
            };
        };

        info!(tool = %name, %id, "Executing tool call");
        let outcome = AssertUnwindSafe(handler.call(args)).catch_unwind().await;
        let (result, action) = match outcome {
            Ok(Ok(output)) => (output.text, output.action),
            Ok(Err(e)) => {
                warn!(tool = %name, %id, error = %e, "Tool call failed");
                (format!("Error: {e}"), None)
            }
            Err(_) => {
                error!(tool = %name, %id, "Tool handler panicked");
                (format!("Error: tool '{name}' failed unexpectedly."), None)
            }
        };
        ToolOutcome {
            result: ToolResultEnvelope { id, name, result },
            action,
        }
    }
}

/// The domain collaborators the standard tool set routes to.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn planner::Planner>,
    pub notebook: Arc<dyn notes::Notebook>,
    pub ledger: Arc<dyn finance::Ledger>,
    pub alarms: Arc<dyn alarms::AlarmClock>,
}

impl Collaborators {
    /// Process-local collaborators, for running without external services.
    pub fn in_memory() -> Self {
        Self {
            planner: Arc::new(planner::MemoryPlanner::default()),
            notebook: Arc::new(notes::MemoryNotebook::default()),
            ledger: Arc::new(finance::MemoryLedger::default()),
            alarms: Arc::new(alarms::MemoryAlarmClock::default()),
        }
    }
}

/// A dispatcher with every standard tool registered against `collab`.
pub fn standard_dispatcher(collab: &Collaborators) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new();
    dispatcher
        .register(planner::AddTask(collab.planner.clone()))
        .register(planner::ListTasks(collab.planner.clone()))
        .register(planner::CompleteTask(collab.planner.clone()))
        .register(planner::AddEvent(collab.planner.clone()))
        .register(planner::ListEvents(collab.planner.clone()))
        .register(notes::AddNote(collab.notebook.clone()))
        .register(notes::SearchNotes(collab.notebook.clone()))
        .register(finance::RecordTransaction(collab.ledger.clone()))
        .register(finance::GetBalance(collab.ledger.clone()))
        .register(alarms::SetTimer(collab.alarms.clone()))
        .register(alarms::SetAlarm(collab.alarms.clone()))
        .register(session::EndSession)
        .register(session::StopListening);
    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        /// Text to repeat back.
        text: String,
    }

    #[async_trait]
    impl Tool for Echo {
        const NAME: &'static str = "echo";
        const DESCRIPTION: &'static str = "Repeats the text.";
        type Args = EchoArgs;

        async fn run(&self, args: EchoArgs) -> Result<ToolOutput, ToolError> {
            if args.text == "boom" {
                panic!("handler exploded");
            }
            if args.text.is_empty() {
                return Err(ToolError::InvalidArguments("text is empty".into()));
            }
            Ok(ToolOutput::text(args.text))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallEnvelope {
        ToolCallEnvelope {
            id: id.into(),
            name: name.into(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut d = ToolDispatcher::new();
        d.register(Echo);
        d
    }

    #[tokio::test]
    async fn successful_call_returns_handler_text() {
        let outcome = dispatcher().execute(call("c1", "echo", json!({"text": "hi"}))).await;
        assert_eq!(
            outcome.result,
            ToolResultEnvelope {
                id: "c1".into(),
                name: "echo".into(),
                result: "hi".into()
            }
        );
        assert_eq!(outcome.action, None);
    }

    #[tokio::test]
    async fn every_failure_mode_still_answers_with_the_same_id() {
        let d = dispatcher();
        let cases = [
            call("a", "echo", json!({"text": ""})),
            call("b", "echo", json!({"wrong": 1})),
            call("c", "echo", json!({"text": "boom"})),
            call("d", "no_such_tool", json!({})),
        ];
        for envelope in cases {
            let id = envelope.id.clone();
            let outcome = d.execute(envelope).await;
            assert_eq!(outcome.result.id, id);
            assert!(outcome.result.result.starts_with("Error:"), "{}", outcome.result.result);
        }
    }

    #[tokio::test]
    async fn unknown_function_is_clearly_marked() {
        let outcome = dispatcher().execute(call("x", "launch_rocket", json!({}))).await;
        assert_eq!(outcome.result.result, "Error: unknown function 'launch_rocket'.");
        assert_eq!(outcome.result.name, "launch_rocket");
    }

    #[tokio::test]
    async fn concurrent_invocations_keep_their_ids() {
        let d = Arc::new(dispatcher());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let d = d.clone();
                tokio::spawn(async move {
                    d.execute(call(&format!("id-{i}"), "echo", json!({"text": format!("t{i}")})))
                        .await
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            let outcome = h.await.unwrap();
            assert_eq!(outcome.result.id, format!("id-{i}"));
            assert_eq!(outcome.result.result, format!("t{i}"));
        }
    }

    #[test]
    fn declarations_carry_a_clean_schema() {
        let decls = dispatcher().declarations();
        assert_eq!(decls.len(), 1);
        let params = &decls[0].parameters;
        assert!(params.get("$schema").is_none());
        assert!(params.get("title").is_none());
        assert_eq!(params["properties"]["text"]["type"], "string");
        assert_eq!(params["required"], json!(["text"]));
    }

    #[test]
    fn nullable_fields_and_title_properties_survive_stripping() {
        #[derive(Deserialize, JsonSchema)]
        #[allow(dead_code)]
        struct Args {
            title: String,
            due: Option<String>,
        }
        let params = parameters_schema::<Args>();
        assert_eq!(params["properties"]["title"]["type"], "string");
        assert_eq!(params["properties"]["due"]["type"], "string");
        assert_eq!(params["properties"]["due"]["nullable"], true);
    }

    #[test]
    fn standard_set_registers_session_controls() {
        let d = standard_dispatcher(&Collaborators::in_memory());
        assert!(d.contains("end_session"));
        assert!(d.contains("stop_listening"));
        assert!(d.contains("complete_task"));
        assert_eq!(d.declarations().len(), 13);
    }
}
