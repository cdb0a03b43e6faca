//! End-to-end run over a two-building stock: sample FKT, ingest,
//! derivation, export and dictionaries, with every diagnostic landing in
//! the run ledger.

use polars::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use stockpost_core::{
    columns::{self as c, Fuel},
    config::{AggregationLevel, ExportEntry, ExportPlan, PartitionColumn, PipelineConfig},
    dictionary::{DATA_DICTIONARY, ENUMERATION_DICTIONARY},
    engine::{PipelineEngine, FAILURE_SUMMARY_FILE},
    error::ErrorKind,
    event::PipelineEvent,
    ingest_stage::results_path,
    kernel,
    store::RunLedger,
    types::{DataTier, FileFormat},
};

const COLUMN_DEFINITIONS: &str = "\
location,original_col_name,original_units,new_col_name,new_units,data_type,field_description,basic_metadata,full_metadata,detailed_metadata
buildstock,in.sqft,ft2,in.sqft,ft2,number,Floor area,true,true,true
buildstock,in.comstock_building_type,,in.comstock_building_type,,string,Building type,true,true,true
results,out.site_energy.total.energy_consumption..kwh,kwh,out.site_energy.total.energy_consumption,kwh,number,Site energy,true,true,true
";

const ENUMERATIONS: &str = "\
enumeration,enumeration_description
SmallOffice,Small office building
Baseline,The existing building stock
";

const BUILDSTOCK: &str = "\
sample_building_id,in.sqft,in.comstock_building_type,in.hvac_system_type,in.state_fips
1,10000.0,SmallOffice,PSZ-AC with gas coil,8
2,20000.0,SmallOffice,PSZ-AC with gas coil,8
";

fn write_results(dir: &Path, upgrade_id: i64, site: [f64; 2], elec: [f64; 2]) {
    let mut df = df!(
        c::BUILDING_ID                                => [1i64, 2],
        c::COMPLETION_STATUS                          => ["Success", "Success"],
        c::site_total_col().as_str()                  => site,
        c::fuel_total_col(Fuel::Electricity).as_str() => elec,
    )
    .expect("results frame");
    kernel::write_parquet(&mut df, &results_path(dir, upgrade_id)).expect("write results");
}

fn config(root: &Path) -> PipelineConfig {
    std::fs::write(root.join("column_definitions.csv"), COLUMN_DEFINITIONS).expect("definitions");
    std::fs::write(root.join("enumerations.csv"), ENUMERATIONS).expect("enumerations");
    std::fs::write(root.join("buildstock.csv"), BUILDSTOCK).expect("buildstock");
    let results = root.join("results");
    write_results(&results, 0, [500.0, 900.0], [200.0, 400.0]);
    write_results(&results, 1, [400.0, 700.0], [200.0, 300.0]);

    let mut config = PipelineConfig::default_test();
    config.upgrade_ids = vec![1];
    config.inputs.results_dir = results;
    config.inputs.buildstock = root.join("buildstock.csv");
    config.inputs.column_definitions = root.join("column_definitions.csv");
    config.inputs.enumeration_definitions = root.join("enumerations.csv");
    config.output_dir = root.join("output");
    config.export.plan = ExportPlan {
        entries: vec![ExportEntry {
            dir:                "by_state".into(),
            partition_cols:     vec![PartitionColumn {
                column: c::STATE.into(),
                label:  "state".into(),
            }],
            aggregation_levels: vec![AggregationLevel::Building, AggregationLevel::National],
            data_tiers:         vec![DataTier::Full],
            file_formats:       vec![FileFormat::Csv],
        }],
    };
    config
}

fn ledger() -> RunLedger {
    let ledger = RunLedger::in_memory().expect("ledger");
    ledger.migrate().expect("migrate");
    ledger
}

#[test]
fn full_run_writes_files_and_ledger() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let out = config.output_dir.clone();

    let mut engine = PipelineEngine::build(config, ledger()).expect("engine");
    let summary = engine.run().expect("run");

    assert_eq!(summary.files.len(), 4, "one building file and one national file per upgrade");
    let csv_root = out.join("by_state").join("full").join("csv");
    for name in [
        "state=CO/CO_baseline.csv",
        "state=CO/CO_upgrade01.csv",
        "national_baseline_agg.csv",
        "national_upgrade01_agg.csv",
    ] {
        assert!(csv_root.join(name).exists(), "missing {name}");
    }
    assert!(out.join(FAILURE_SUMMARY_FILE).exists());
    assert!(out.join(DATA_DICTIONARY).exists());
    assert!(out.join(ENUMERATION_DICTIONARY).exists());
    assert_eq!(summary.failure_summaries.len(), 2);
    assert!(summary.shortfalls.is_empty(), "apportionment is disabled");

    let national = kernel::read_csv(&csv_root.join("national_upgrade01_agg.csv")).expect("national");
    let weight = kernel::f64_values(&national, c::WEIGHT, "test").expect("weight");
    assert_eq!(weight, vec![Some(2.0)], "sample FKT weights are one per building");

    let counts = engine.ledger().counts(&engine.run_id).expect("counts");
    assert_eq!(counts.failure_summaries, 2);
    assert_eq!(counts.shortfalls, 0);
    let fraction = engine
        .ledger()
        .failure_fraction(&engine.run_id, 1)
        .expect("fraction")
        .expect("upgrade 1 recorded");
    assert_eq!(fraction, 0.0);
}

#[test]
fn ledger_events_follow_the_stage_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut engine = PipelineEngine::build(config(dir.path()), ledger()).expect("engine");
    engine.run().expect("run");

    let entries = engine.ledger().events_for_run(&engine.run_id).expect("events");
    let first = entries.first().expect("at least one event").event().expect("decode");
    assert!(matches!(first, PipelineEvent::RunInitialized { seed: 42, .. }));

    let started: Vec<String> = entries
        .iter()
        .filter_map(|e| match e.event() {
            Ok(PipelineEvent::StageStarted { stage }) => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["apportionment", "rescale", "ingest", "derivation", "export"]);

    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &entries {
        *by_type.entry(entry.event_type.clone()).or_insert(0) += 1;
    }
    assert_eq!(by_type.get("stage_completed"), Some(&5));
    assert_eq!(by_type.get("failure_summary_recorded"), Some(&2));
    assert_eq!(by_type.get("export_file_written"), Some(&4));
    assert_eq!(by_type.get("dictionary_written"), Some(&2));
}

#[test]
fn missing_results_stop_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.upgrade_ids = vec![1, 2];
    let mut engine = PipelineEngine::build(config, ledger()).expect("engine");
    let err = match engine.run() {
        Ok(_) => panic!("upgrade 2 has no results file"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::MissingRequiredInput);
}

#[test]
fn missing_column_definitions_fail_the_build() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.inputs.column_definitions = dir.path().join("absent.csv");
    let err = match PipelineEngine::build(config, ledger()) {
        Ok(_) => panic!("the registry file is required"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::MissingRequiredInput);
}
