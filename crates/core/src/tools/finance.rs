//! Personal finance tools.

use super::{NoArgs, Tool, ToolOutput};
use crate::error::ToolError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Signed amount in minor units (cents). Negative is spending.
    pub amount_cents: i64,
    pub category: String,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record_transaction(
        &self,
        amount_cents: i64,
        category: String,
        note: Option<String>,
    ) -> Result<Transaction>;
    async fn balance_cents(&self) -> Result<i64>;
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<Transaction>>,
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_transaction(
        &self,
        amount_cents: i64,
        category: String,
        note: Option<String>,
    ) -> Result<Transaction> {
        let tx = Transaction {
            amount_cents,
            category,
            note,
            recorded_at: Utc::now(),
        };
        self.entries.lock().await.push(tx.clone());
        Ok(tx)
    }

    async fn balance_cents(&self) -> Result<i64> {
        Ok(self.entries.lock().await.iter().map(|t| t.amount_cents).sum())
    }
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub struct RecordTransaction(pub Arc<dyn Ledger>);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecordTransactionArgs {
    /// Amount in currency units. Negative for expenses, positive for income.
    pub amount: f64,
    /// Spending or income category, e.g. groceries.
    pub category: String,
    pub note: Option<String>,
}

#[async_trait]
impl Tool for RecordTransaction {
    const NAME: &'static str = "record_transaction";
    const DESCRIPTION: &'static str = "Records an expense or income in the user's ledger.";
    type Args = RecordTransactionArgs;

    async fn run(&self, args: RecordTransactionArgs) -> Result<ToolOutput, ToolError> {
        if !args.amount.is_finite() {
            return Err(ToolError::InvalidArguments("amount must be a finite number".into()));
        }
        let cents = (args.amount * 100.0).round() as i64;
        let tx = self.0.record_transaction(cents, args.category, args.note).await?;
        Ok(ToolOutput::text(format!(
            "Recorded {} under {}.",
            format_cents(tx.amount_cents),
            tx.category
        )))
    }
}

pub struct GetBalance(pub Arc<dyn Ledger>);

#[async_trait]
impl Tool for GetBalance {
    const NAME: &'static str = "get_balance";
    const DESCRIPTION: &'static str = "Returns the current ledger balance.";
    type Args = NoArgs;

    async fn run(&self, _args: NoArgs) -> Result<ToolOutput, ToolError> {
        let balance = self.0.balance_cents().await?;
        Ok(ToolOutput::text(format!("Balance is {}.", format_cents(balance))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minor_units() {
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(-5), "-0.05");
        assert_eq!(format_cents(0), "0.00");
    }

    #[tokio::test]
    async fn balance_sums_recorded_amounts() {
        let ledger = Arc::new(MemoryLedger::default());
        let record = RecordTransaction(ledger.clone());
        record
            .run(RecordTransactionArgs {
                amount: 100.0,
                category: "salary".into(),
                note: None,
            })
            .await
            .unwrap();
        let out = record
            .run(RecordTransactionArgs {
                amount: -12.5,
                category: "groceries".into(),
                note: Some("market".into()),
            })
            .await
            .unwrap();
        assert_eq!(out.text, "Recorded -12.50 under groceries.");

        let balance = GetBalance(ledger).run(NoArgs {}).await.unwrap();
        assert_eq!(balance.text, "Balance is 87.50.");
    }

    #[tokio::test]
    async fn non_finite_amounts_are_rejected() {
        let record = RecordTransaction(Arc::new(MemoryLedger::default()));
        let err = record
            .run(RecordTransactionArgs {
                amount: f64::NAN,
                category: "x".into(),
                note: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
