//! SQLite run ledger.
//!
//! RULE: Only store.rs talks to the database.
//! Stages hand their diagnostics to the engine; the engine calls ledger
//! methods. Nothing else executes SQL.

use crate::{
    apportionment_stage::BucketShortfall,
    error::PipelineResult,
    event::{EventLogEntry, PipelineEvent},
    ingest_stage::FailureSummary,
    types::{RunId, UpgradeId},
};
use rusqlite::{params, Connection};

pub struct RunLedger {
    conn: Connection,
}

/// Row counts per ledger table, for end-of-run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerCounts {
    pub events:            u64,
    pub failure_summaries: u64,
    pub shortfalls:        u64,
}

impl RunLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory ledger (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn.execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, seed: u64, dataset: &str, version: &str) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, seed, dataset, version, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, seed as i64, dataset, version, now()],
        )?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, stage, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.stage,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    /// Serialize and append one event.
    pub fn record(&self, run_id: &RunId, stage: &str, event: &PipelineEvent) -> PipelineResult<()> {
        let entry = EventLogEntry {
            id:         None,
            run_id:     run_id.clone(),
            stage:      stage.to_string(),
            event_type: event.type_name().to_string(),
            payload:    serde_json::to_string(event)?,
            created_at: now(),
        };
        self.append_event(&entry)
    }

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, stage, event_type, payload, created_at
             FROM event_log WHERE run_id = ?1
             ORDER BY id ASC"
        )?;
        let entries = stmt.query_map(params![run_id], |row| {
            Ok(EventLogEntry {
                id:         Some(row.get(0)?),
                run_id:     row.get(1)?,
                stage:      row.get(2)?,
                event_type: row.get(3)?,
                payload:    row.get(4)?,
                created_at: row.get(5)?,
            })
        })?.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Diagnostics ────────────────────────────────────────────

    pub fn record_failure_summary(&self, run_id: &str, summary: &FailureSummary) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO failure_summary (
                run_id, upgrade_id, upgrade_name, total, success, not_applicable, fail,
                fraction_fail, fraction_applicable,
                success_in_base_fail_in_upgrade, success_in_upgrade_fail_in_base, failure_modes
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run_id,
                summary.upgrade_id,
                summary.upgrade_name,
                summary.total as i64,
                summary.success as i64,
                summary.not_applicable as i64,
                summary.fail as i64,
                summary.fraction_fail,
                summary.fraction_applicable,
                summary.success_in_base_fail_in_upgrade as i64,
                summary.success_in_upgrade_fail_in_base as i64,
                serde_json::to_string(&summary.failure_modes)?,
            ],
        )?;
        Ok(())
    }

    pub fn failure_fraction(&self, run_id: &str, upgrade_id: UpgradeId) -> PipelineResult<Option<f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT fraction_fail FROM failure_summary WHERE run_id = ?1 AND upgrade_id = ?2"
        )?;
        let mut rows = stmt.query_map(params![run_id, upgrade_id], |row| row.get::<_, f64>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn record_shortfall(&self, run_id: &str, shortfall: &BucketShortfall) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO apportionment_shortfall (run_id, bucket, truth_rows, truth_sqft)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                shortfall.bucket,
                shortfall.truth_rows as i64,
                shortfall.truth_sqft,
            ],
        )?;
        Ok(())
    }

    pub fn counts(&self, run_id: &str) -> PipelineResult<LedgerCounts> {
        let count = |table: &str| -> PipelineResult<u64> {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE run_id = ?1"),
                params![run_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };
        Ok(LedgerCounts {
            events:            count("event_log")?,
            failure_summaries: count("failure_summary")?,
            shortfalls:        count("apportionment_shortfall")?,
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A fresh run id.
pub fn new_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}
