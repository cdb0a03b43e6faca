//! RunLedger: event round-trips, diagnostic tables and per-run counts.

use std::collections::BTreeMap;
use stockpost_core::{
    apportionment_stage::BucketShortfall,
    event::PipelineEvent,
    ingest_stage::FailureSummary,
    store::{new_run_id, LedgerCounts, RunLedger},
};

fn ledger_with_run(run_id: &str) -> RunLedger {
    let ledger = RunLedger::in_memory().expect("in-memory ledger");
    ledger.migrate().expect("migrate");
    ledger.insert_run(run_id, 42, "ledger test", "0.0.0").expect("insert run");
    ledger
}

fn summary(upgrade_id: i64, fail: usize) -> FailureSummary {
    FailureSummary {
        upgrade_id,
        upgrade_name:                    format!("upgrade {upgrade_id}"),
        total:                           10,
        success:                         10 - fail,
        not_applicable:                  0,
        fail,
        fraction_fail:                   fail as f64 / 10.0,
        fraction_not_applicable:         0.0,
        fraction_applicable:             1.0,
        success_in_base_fail_in_upgrade: fail,
        success_in_upgrade_fail_in_base: 0,
        failure_modes:                   BTreeMap::from([("Fail: missing results".to_string(), fail)]),
    }
}

#[test]
fn events_round_trip_in_order() {
    let run_id = new_run_id();
    let ledger = ledger_with_run(&run_id);
    let events = [
        PipelineEvent::RunInitialized {
            run_id:  run_id.clone(),
            seed:    42,
            dataset: "ledger test".into(),
        },
        PipelineEvent::StageStarted { stage: "ingest".into() },
        PipelineEvent::FailureSummaryRecorded {
            upgrade_id:       1,
            total:            10,
            failed:           1,
            failure_fraction: 0.1,
        },
        PipelineEvent::StageCompleted { stage: "ingest".into() },
    ];
    for event in &events {
        ledger.record(&run_id, "ingest", event).expect("record");
    }

    let entries = ledger.events_for_run(&run_id).expect("events");
    assert_eq!(entries.len(), events.len());
    for (entry, expected) in entries.iter().zip(&events) {
        assert_eq!(entry.event_type, expected.type_name());
        assert_eq!(&entry.event().expect("decode payload"), expected);
        assert!(entry.id.is_some(), "persisted rows carry their id");
    }
}

#[test]
fn events_are_scoped_to_their_run() {
    let first = new_run_id();
    let second = new_run_id();
    assert_ne!(first, second, "run ids are unique");

    let ledger = ledger_with_run(&first);
    ledger.insert_run(&second, 7, "ledger test", "0.0.0").expect("second run");
    ledger
        .record(&first, "export", &PipelineEvent::ExportFileWritten { path: "a.csv".into() })
        .expect("record");
    assert_eq!(ledger.events_for_run(&first).expect("first").len(), 1);
    assert!(ledger.events_for_run(&second).expect("second").is_empty());
}

#[test]
fn failure_fraction_reads_back_per_upgrade() {
    let run_id = new_run_id();
    let ledger = ledger_with_run(&run_id);
    ledger.record_failure_summary(&run_id, &summary(0, 0)).expect("baseline");
    ledger.record_failure_summary(&run_id, &summary(3, 2)).expect("upgrade 3");

    assert_eq!(ledger.failure_fraction(&run_id, 0).expect("query"), Some(0.0));
    let fraction = ledger.failure_fraction(&run_id, 3).expect("query").expect("recorded");
    assert!((fraction - 0.2).abs() < 1e-12);
    assert_eq!(ledger.failure_fraction(&run_id, 9).expect("query"), None);
}

#[test]
fn counts_cover_every_table() {
    let run_id = new_run_id();
    let ledger = ledger_with_run(&run_id);
    assert_eq!(ledger.counts(&run_id).expect("counts"), LedgerCounts::default());

    ledger.record_failure_summary(&run_id, &summary(0, 0)).expect("summary");
    ledger
        .record_shortfall(&run_id, &BucketShortfall {
            bucket:     "R3|Hospital|2|PSZ-AC|Electricity".into(),
            truth_rows: 4,
            truth_sqft: 80_000.0,
        })
        .expect("shortfall");
    ledger
        .record(&run_id, "engine", &PipelineEvent::StageStarted { stage: "export".into() })
        .expect("event");

    assert_eq!(
        ledger.counts(&run_id).expect("counts"),
        LedgerCounts {
            events:            1,
            failure_summaries: 1,
            shortfalls:        1,
        }
    );
}
