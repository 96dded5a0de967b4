//! Data Access Layer
//!
//! Postgres-backed `ConversationStore`. Queries are built at runtime so the
//! crate compiles without a live database.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};
use lumen_core::store::{ConversationStore, UserRule};
use lumen_core::transcript::{Citation, TranscriptTurn};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    id: Uuid,
    author: String,
    text: String,
    citations: Json<Vec<Citation>>,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TurnRow> for TranscriptTurn {
    type Error = anyhow::Error;

    fn try_from(row: TurnRow) -> Result<Self> {
        Ok(TranscriptTurn {
            id: row.id,
            author: row.author.parse().map_err(|e: String| anyhow!(e))?,
            text: row.text,
            citations: row.citations.0,
            kind: row.kind.parse().map_err(|e: String| anyhow!(e))?,
            timestamp: row.created_at,
        })
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn add_rule(&self, text: &str) -> Result<UserRule> {
        let rule = UserRule::new(text);
        sqlx::query("INSERT INTO user_rules (id, text) VALUES ($1, $2)")
            .bind(rule.id)
            .bind(&rule.text)
            .execute(&self.pool)
            .await?;
        Ok(rule)
    }
}

/// `[start, end)` in UTC for a calendar day.
/// UTC instants bounding the calendar `day` as seen in `tz`.
fn day_bounds<Tz: TimeZone>(day: NaiveDate, tz: &Tz) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .and_then(|t| tz.from_local_datetime(&t).earliest())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("no local midnight on {d}"))
    };
    let next = day
        .checked_add_days(Days::new(1))
        .ok_or_else(|| anyhow!("day {day} out of range"))?;
    Ok((midnight(day)?, midnight(next)?))
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn standing_rules(&self) -> Result<Vec<UserRule>> {
        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, text FROM user_rules ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, text)| UserRule { id, text })
            .collect())
    }

    async fn conversation_for_day(&self, day: NaiveDate) -> Result<Vec<TranscriptTurn>> {
        let (start, end) = day_bounds(day, &Local)?;
        let rows: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, author, text, citations, kind, created_at
            FROM transcript_turns
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TranscriptTurn::try_from).collect()
    }

    async fn append_turn(&self, turn: &TranscriptTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcript_turns (id, author, text, citations, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(turn.id)
        .bind(turn.author.to_string())
        .bind(&turn.text)
        .bind(Json(&turn.citations))
        .bind(turn.kind.to_string())
        .bind(turn.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_turn(&self, turn: &TranscriptTurn) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transcript_turns SET text = $2, citations = $3, kind = $4 WHERE id = $1",
        )
        .bind(turn.id)
        .bind(&turn.text)
        .bind(Json(&turn.citations))
        .bind(turn.kind.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("turn {} was never appended", turn.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn day_bounds_cover_one_calendar_day() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let (start, end) = day_bounds(day, &Utc).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-02-28T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-02-29T00:00:00+00:00");

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let (start, end) = day_bounds(day, &plus_two).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-02-27T22:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-02-28T22:00:00+00:00");
    }

    #[test]
    fn rows_with_unknown_author_are_rejected() {
        let row = TurnRow {
            id: Uuid::new_v4(),
            author: "narrator".into(),
            text: "hi".into(),
            citations: Json(Vec::new()),
            kind: "message".into(),
            created_at: Utc::now(),
        };
        assert!(TranscriptTurn::try_from(row).is_err());
    }
}
