//! Timer and alarm tools.
//!
//! The alarm clock only records what was requested; firing and ringing are
//! the host's business.

use super::{Tool, ToolOutput};
use crate::error::ToolError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bound for a countdown timer, one day.
const MAX_TIMER_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Timer,
    Alarm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub kind: AlarmKind,
    pub label: Option<String>,
    /// For timers, the absolute expiry; for alarms, today's date at `time`.
    pub fires_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlarmClock: Send + Sync {
    async fn set_timer(&self, seconds: u64, label: Option<String>) -> Result<Alarm>;
    async fn set_alarm(&self, time: NaiveTime, label: Option<String>) -> Result<Alarm>;
}

#[derive(Debug, Default)]
pub struct MemoryAlarmClock {
    alarms: Mutex<Vec<Alarm>>,
}

impl MemoryAlarmClock {
    pub async fn pending(&self) -> Vec<Alarm> {
        self.alarms.lock().await.clone()
    }

    async fn push(&self, kind: AlarmKind, label: Option<String>, fires_at: DateTime<Utc>) -> Alarm {
        let mut alarms = self.alarms.lock().await;
        let alarm = Alarm {
            id: format!("a{}", alarms.len() + 1),
            kind,
            label,
            fires_at,
        };
        alarms.push(alarm.clone());
        alarm
    }
}

#[async_trait]
impl AlarmClock for MemoryAlarmClock {
    async fn set_timer(&self, seconds: u64, label: Option<String>) -> Result<Alarm> {
        let fires_at = Utc::now() + Duration::seconds(seconds as i64);
        Ok(self.push(AlarmKind::Timer, label, fires_at).await)
    }

    async fn set_alarm(&self, time: NaiveTime, label: Option<String>) -> Result<Alarm> {
        let now = Utc::now();
        let mut fires_at = now.date_naive().and_time(time).and_utc();
        if fires_at <= now {
            fires_at += Duration::days(1);
        }
        Ok(self.push(AlarmKind::Alarm, label, fires_at).await)
    }
}

fn labelled(what: &str, label: &Option<String>) -> String {
    match label {
        Some(l) => format!("{what} '{l}'"),
        None => what.to_string(),
    }
}

pub struct SetTimer(pub Arc<dyn AlarmClock>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetTimerArgs {
    /// Countdown length in seconds.
    pub seconds: u64,
    pub label: Option<String>,
}

#[async_trait]
impl Tool for SetTimer {
    const NAME: &'static str = "set_timer";
    const DESCRIPTION: &'static str = "Starts a countdown timer.";
    type Args = SetTimerArgs;

    async fn run(&self, args: SetTimerArgs) -> Result<ToolOutput, ToolError> {
        if args.seconds == 0 || args.seconds > MAX_TIMER_SECONDS {
            return Err(ToolError::InvalidArguments(format!(
                "seconds must be between 1 and {MAX_TIMER_SECONDS}"
            )));
        }
        let alarm = self.0.set_timer(args.seconds, args.label).await?;
        Ok(ToolOutput::text(format!(
            "{} set for {} seconds.",
            labelled("Timer", &alarm.label),
            args.seconds
        )))
    }
}

pub struct SetAlarm(pub Arc<dyn AlarmClock>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetAlarmArgs {
    /// Local wall-clock time as HH:MM (24-hour).
    pub time: String,
    pub label: Option<String>,
}

#[async_trait]
impl Tool for SetAlarm {
    const NAME: &'static str = "set_alarm";
    const DESCRIPTION: &'static str = "Sets an alarm for a time of day.";
    type Args = SetAlarmArgs;

    async fn run(&self, args: SetAlarmArgs) -> Result<ToolOutput, ToolError> {
        let time = NaiveTime::parse_from_str(&args.time, "%H:%M")
            .map_err(|e| ToolError::InvalidArguments(format!("time: {e}")))?;
        let alarm = self.0.set_alarm(time, args.label).await?;
        Ok(ToolOutput::text(format!(
            "{} set for {}.",
            labelled("Alarm", &alarm.label),
            time.format("%H:%M")
        )))
    }
}
