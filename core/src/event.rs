//! Pipeline events: the append-only record of a run.
//!
//! RULE: every diagnostic a stage emits is both logged and appended to the
//! run ledger as one of these events. Variants are only ever appended.

use crate::types::{RunId, UpgradeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Engine events ──────────────────────────────
    RunInitialized {
        run_id:  RunId,
        seed:    u64,
        dataset: String,
    },
    StageStarted {
        stage: String,
    },
    StageCompleted {
        stage: String,
    },
    CheckpointMaterialized {
        stage: String,
        path:  String,
    },

    // ── Ingest events ──────────────────────────────
    FailureSummaryRecorded {
        upgrade_id:         UpgradeId,
        total:              u64,
        failed:             u64,
        failure_fraction:   f64,
    },
    BaselineFailuresExcluded {
        buildings: u64,
    },

    // ── Apportionment and rescale events ───────────
    ApportionmentShortfall {
        bucket:     String,
        truth_rows: u64,
        truth_sqft: f64,
    },
    RescaleFactor {
        building_type: String,
        factor:        f64,
        in_window:     bool,
    },

    // ── Export events ──────────────────────────────
    ExportFileWritten {
        path: String,
    },
    DictionaryWritten {
        path: String,
    },
}

impl PipelineEvent {
    /// Stable name stored in the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunInitialized { .. }         => "run_initialized",
            Self::StageStarted { .. }           => "stage_started",
            Self::StageCompleted { .. }         => "stage_completed",
            Self::CheckpointMaterialized { .. } => "checkpoint_materialized",
            Self::FailureSummaryRecorded { .. } => "failure_summary_recorded",
            Self::BaselineFailuresExcluded { .. } => "baseline_failures_excluded",
            Self::ApportionmentShortfall { .. } => "apportionment_shortfall",
            Self::RescaleFactor { .. }          => "rescale_factor",
            Self::ExportFileWritten { .. }      => "export_file_written",
            Self::DictionaryWritten { .. }      => "dictionary_written",
        }
    }
}

/// One persisted row of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub stage:      String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized PipelineEvent
    pub created_at: String,
}

impl EventLogEntry {
    pub fn event(&self) -> serde_json::Result<PipelineEvent> {
        serde_json::from_str(&self.payload)
    }
}
