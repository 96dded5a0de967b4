//! Tools that act on the live session itself.
//!
//! Both return their action instead of performing it; the controller runs it
//! once the result has gone back to the remote model.

use super::{NoArgs, SessionAction, Tool, ToolOutput};
use crate::error::ToolError;
use async_trait::async_trait;

pub struct EndSession;

#[async_trait]
impl Tool for EndSession {
    const NAME: &'static str = "end_session";
    const DESCRIPTION: &'static str =
        "Ends the voice session. Call when the user says goodbye or asks to stop talking.";
    type Args = NoArgs;

    async fn run(&self, _args: NoArgs) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("Ending the session.").with_action(SessionAction::EndSession))
    }
}

pub struct StopListening;

#[async_trait]
impl Tool for StopListening {
    const NAME: &'static str = "stop_listening";
    const DESCRIPTION: &'static str =
        "Turns the microphone off while keeping the session open for typed messages.";
    type Args = NoArgs;

    async fn run(&self, _args: NoArgs) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("Microphone is off.").with_action(SessionAction::StopListening))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolCallEnvelope, ToolDispatcher};

    #[tokio::test]
    async fn session_tools_defer_their_action() {
        let mut d = ToolDispatcher::new();
        d.register(EndSession).register(StopListening);

        let end = d
            .execute(ToolCallEnvelope {
                id: "1".into(),
                name: "end_session".into(),
                args: Default::default(),
            })
            .await;
        assert_eq!(end.action, Some(SessionAction::EndSession));
        assert_eq!(end.result.result, "Ending the session.");

        let stop = d
            .execute(ToolCallEnvelope {
                id: "2".into(),
                name: "stop_listening".into(),
                args: Default::default(),
            })
            .await;
        assert_eq!(stop.action, Some(SessionAction::StopListening));
    }
}
