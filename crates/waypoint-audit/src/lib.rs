//! Append-only audit ledger.
//!
//! Every decision made anywhere in the control plane — policy
//! evaluations, task lifecycle transitions, command execution, agent
//! connect/disconnect — is recorded here. Records within a
//! `correlation_id` chain (typically one task or one session) carry a
//! strictly increasing `sequence_num` so a reader can detect gaps or
//! reordering. The ledger keeps a bounded in-memory ring buffer for fast
//! queries and mirrors every record to a date-rotated JSONL file on disk
//! for durable, greppable history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use waypoint_policy::{Effect, LedgerLevel};

const DEFAULT_MAX_RECORDS: usize = 100_000;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to write audit log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize ledger event: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerActor {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub agent_id: Option<String>,
    pub delegation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub sequence_num: u64,
    pub layer: String,
    pub actor: LedgerActor,
    pub action: String,
    pub resource: String,
    pub decision: Effect,
    pub ledger_level: LedgerLevel,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub asserted_facts: Vec<String>,
    #[serde(default)]
    pub fact_evidence: serde_json::Value,
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl LedgerEvent {
    /// Build an event; `sequence_num` is filled in by `AuditLedger::record`.
    pub fn new(
        correlation_id: impl Into<String>,
        layer: impl Into<String>,
        actor: LedgerActor,
        action: impl Into<String>,
        resource: impl Into<String>,
        decision: Effect,
        ledger_level: LedgerLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            sequence_num: 0,
            layer: layer.into(),
            actor,
            action: action.into(),
            resource: resource.into(),
            decision,
            ledger_level,
            reason: None,
            asserted_facts: Vec::new(),
            fact_evidence: serde_json::Value::Null,
            claims: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(truncate(reason.into()));
        self
    }

    pub fn with_asserted_facts(mut self, facts: Vec<String>) -> Self {
        self.asserted_facts = facts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

fn truncate(s: String) -> String {
    const MAX_LEN: usize = 500;
    if s.len() > MAX_LEN {
        s.chars().take(MAX_LEN).collect()
    } else {
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    pub correlation_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub decision: Option<Effect>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl LedgerQuery {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        if let Some(cid) = &self.correlation_id {
            if &event.correlation_id != cid {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &event.action != action {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if &event.resource != resource {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if event.decision != decision {
                return false;
            }
        }
        if let Some(start) = self.start {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// Audit ledger: bounded in-memory ring buffer plus date-rotated JSONL
/// persistence.
pub struct AuditLedger {
    records: Arc<RwLock<VecDeque<LedgerEvent>>>,
    max_records: usize,
    log_dir: PathBuf,
    sequence_counters: Arc<RwLock<HashMap<String, u64>>>,
}

impl AuditLedger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(log_dir, DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(log_dir: impl Into<PathBuf>, max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records,
            log_dir: log_dir.into(),
            sequence_counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn log_file_path(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append a record. The event's `sequence_num` is overwritten with the
    /// next value in its correlation chain, monotonically non-decreasing.
    pub async fn record(&self, mut event: LedgerEvent) -> Result<LedgerEvent, AuditError> {
        {
            let mut counters = self.sequence_counters.write().await;
            let next = counters.entry(event.correlation_id.clone()).or_insert(0);
            *next += 1;
            event.sequence_num = *next;
        }

        self.persist(&event)?;

        let mut records = self.records.write().await;
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(event.clone());
        tracing::info!(
            correlation_id = %event.correlation_id,
            sequence_num = event.sequence_num,
            action = %event.action,
            decision = ?event.decision,
            "ledger event recorded"
        );
        Ok(event)
    }

    fn persist(&self, event: &LedgerEvent) -> Result<(), AuditError> {
        std::fs::create_dir_all(&self.log_dir).map_err(|e| AuditError::Io {
            path: self.log_dir.clone(),
            source: e,
        })?;
        let path = self.log_file_path(event.timestamp.date_naive());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::Io { path: path.clone(), source: e })?;

        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}").map_err(|e| AuditError::Io { path: path.clone(), source: e })?;

        if matches!(event.ledger_level, LedgerLevel::Action | LedgerLevel::Full) {
            file.sync_all().map_err(|e| AuditError::Io { path, source: e })?;
        }
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Query the in-memory ring buffer with an AND of every set filter,
    /// newest-first, paginated. `limit` is clamped to 1000.
    pub async fn query(&self, query: &LedgerQuery) -> Vec<LedgerEvent> {
        let limit = query.limit.min(1000).max(1);
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> LedgerActor {
        LedgerActor {
            agent_id: Some("agent-1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sequence_numbers_increase_within_a_correlation_chain() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AuditLedger::new(dir.path());

        let e1 = ledger
            .record(LedgerEvent::new(
                "corr-1",
                "scheduler",
                actor(),
                "task.created",
                "task/1",
                Effect::Allow,
                LedgerLevel::Decision,
            ))
            .await
            .unwrap();
        let e2 = ledger
            .record(LedgerEvent::new(
                "corr-1",
                "scheduler",
                actor(),
                "task.started",
                "task/1",
                Effect::Allow,
                LedgerLevel::Decision,
            ))
            .await
            .unwrap();

        assert_eq!(e1.sequence_num, 1);
        assert_eq!(e2.sequence_num, 2);
    }

    #[tokio::test]
    async fn query_filters_are_anded_together() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AuditLedger::new(dir.path());

        ledger
            .record(LedgerEvent::new(
                "corr-1",
                "scheduler",
                actor(),
                "task.created",
                "task/1",
                Effect::Allow,
                LedgerLevel::Decision,
            ))
            .await
            .unwrap();
        ledger
            .record(LedgerEvent::new(
                "corr-2",
                "scheduler",
                actor(),
                "task.created",
                "task/2",
                Effect::Deny,
                LedgerLevel::Decision,
            ))
            .await
            .unwrap();

        let results = ledger
            .query(&LedgerQuery {
                action: Some("task.created".into()),
                decision: Some(Effect::Deny),
                limit: 10,
                ..Default::default()
            })
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].correlation_id, "corr-2");
    }

    #[tokio::test]
    async fn persists_to_a_date_rotated_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AuditLedger::new(dir.path());
        let event = ledger
            .record(LedgerEvent::new(
                "corr-1",
                "scheduler",
                actor(),
                "task.created",
                "task/1",
                Effect::Allow,
                LedgerLevel::Decision,
            ))
            .await
            .unwrap();

        let path = ledger.log_file_path(event.timestamp.date_naive());
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("task.created"));
    }
}
