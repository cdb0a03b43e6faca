//! ResultsIngest: completion classification, baseline backfill and the
//! failure gate, run against small in-memory result tables.

use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use stockpost_core::{
    column_registry::ColumnRegistry,
    columns::{self as c, Fuel},
    error::{ErrorKind, PipelineError},
    ingest_stage::{
        backfill_from_baseline, covariates_from_frame, ingest_results, reload_cached, IngestSettings,
        VERIFIED_FAIL_MISSING, VERIFIED_NOT_APPLICABLE,
    },
    kernel,
    types::UpgradeId,
};

const HEATING: &str = "out.natural_gas.heating.energy_consumption..kwh";

fn empty_registry() -> ColumnRegistry {
    ColumnRegistry::from_definitions(Vec::new(), BTreeMap::new(), false, 10)
        .expect("empty registry")
}

fn settings(threshold: f64) -> IngestSettings {
    IngestSettings {
        dataset:                        "ingest test".into(),
        acceptable_failure_fraction:    threshold,
        drop_failed_baseline_buildings: true,
    }
}

fn covariates() -> LazyFrame {
    let df = df!(
        "sample_building_id" => [1i64, 2],
        c::FLR_AREA          => [10_000.0f64, 3_000.0],
        c::BLDG_TYPE         => ["SmallOffice", "FullServiceRestaurant"],
    )
    .expect("covariates frame");
    covariates_from_frame(df, &empty_registry()).expect("covariates")
}

fn results(
    statuses: [&str; 2],
    site: [Option<f64>; 2],
    elec: [Option<f64>; 2],
    heating: [Option<f64>; 2],
) -> LazyFrame {
    df!(
        c::BUILDING_ID                           => [1i64, 2],
        c::COMPLETION_STATUS                     => statuses,
        c::site_total_col().as_str()             => site,
        c::fuel_total_col(Fuel::Electricity).as_str() => elec,
        HEATING                                  => heating,
    )
    .expect("results frame")
    .lazy()
}

fn baseline() -> LazyFrame {
    results(
        ["Success", "Success"],
        [Some(500.0), Some(300.0)],
        [Some(200.0), Some(100.0)],
        [Some(300.0), Some(200.0)],
    )
}

/// (building_id, upgrade_id) → row index of the materialized frame.
fn index(df: &DataFrame) -> HashMap<(i64, i64), usize> {
    let ids = kernel::i64_values(df, c::BUILDING_ID, "test").expect("ids");
    let upgrades = kernel::i64_values(df, c::UPGRADE_ID, "test").expect("upgrades");
    ids.into_iter()
        .zip(upgrades)
        .enumerate()
        .map(|(row, (id, up))| ((id.expect("id"), up.expect("upgrade")), row))
        .collect()
}

#[test]
fn not_applicable_upgrade_row_carries_baseline_values() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut raw: BTreeMap<UpgradeId, LazyFrame> = BTreeMap::new();
    raw.insert(0, baseline());
    raw.insert(
        1,
        results(
            ["Success", "Invalid"],
            [Some(400.0), None],
            [Some(200.0), None],
            [Some(200.0), None],
        ),
    );

    let out = ingest_results(raw, &covariates(), &settings(0.01), dir.path()).expect("ingest");
    let df = out.frame.collect().expect("collect");
    let rows = index(&df);
    assert_eq!(rows.len(), 4, "two buildings x two upgrades");

    let heating = kernel::f64_values(&df, HEATING, "test").expect("heating");
    let applicability = kernel::bool_values(&df, c::APPLICABILITY, "test").expect("applicability");
    let verified = kernel::str_values(&df, c::VERIFIED_STATUS, "test").expect("verified");

    let up1_b1 = rows[&(1, 1)];
    assert_eq!(heating[up1_b1], Some(200.0), "successful upgrade row keeps its own value");
    assert_eq!(applicability[up1_b1], Some(true));

    let base_b2 = rows[&(2, 0)];
    let up1_b2 = rows[&(2, 1)];
    assert_eq!(heating[up1_b2], heating[base_b2], "invalid row must equal the baseline");
    assert_eq!(applicability[up1_b2], Some(false));
    assert_eq!(verified[up1_b2].as_deref(), Some(VERIFIED_NOT_APPLICABLE));

    let upgrade_summary = out.summaries.iter().find(|s| s.upgrade_id == 1).expect("summary");
    assert_eq!(upgrade_summary.total, 2);
    assert_eq!(upgrade_summary.success, 1);
    assert_eq!(upgrade_summary.not_applicable, 1);
    assert_eq!(upgrade_summary.fail, 0);
    assert!((upgrade_summary.fraction_applicable - 0.5).abs() < 1e-12);
}

#[test]
fn success_without_results_is_reclassified_and_backfilled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut raw: BTreeMap<UpgradeId, LazyFrame> = BTreeMap::new();
    raw.insert(0, baseline());
    raw.insert(
        1,
        results(
            ["Success", "Success"],
            [Some(400.0), Some(250.0)],
            [Some(200.0), None],
            [Some(200.0), Some(150.0)],
        ),
    );

    let out = ingest_results(raw, &covariates(), &settings(0.6), dir.path()).expect("ingest");
    let df = out.frame.collect().expect("collect");
    let rows = index(&df);

    let verified = kernel::str_values(&df, c::VERIFIED_STATUS, "test").expect("verified");
    let status = kernel::str_values(&df, c::COMPLETION_STATUS, "test").expect("status");
    let heating = kernel::f64_values(&df, HEATING, "test").expect("heating");
    let applicability = kernel::bool_values(&df, c::APPLICABILITY, "test").expect("applicability");

    let row = rows[&(2, 1)];
    assert_eq!(verified[row].as_deref(), Some(VERIFIED_FAIL_MISSING));
    assert_eq!(status[row].as_deref(), Some("Fail"));
    assert_eq!(heating[row], Some(200.0), "failed row replaced by baseline values");
    assert_eq!(applicability[row], Some(false));

    let summary = out.summaries.iter().find(|s| s.upgrade_id == 1).expect("summary");
    assert_eq!(summary.failure_modes.get(VERIFIED_FAIL_MISSING), Some(&1));
}

#[test]
fn failure_rate_above_threshold_aborts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut raw: BTreeMap<UpgradeId, LazyFrame> = BTreeMap::new();
    raw.insert(0, baseline());
    raw.insert(
        1,
        results(
            ["Success", "Fail"],
            [Some(400.0), None],
            [Some(200.0), None],
            [Some(200.0), None],
        ),
    );

    let err = match ingest_results(raw, &covariates(), &settings(0.01), dir.path()) {
        Ok(_) => panic!("a 50% failure rate must exceed a 1% threshold"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::UpgradeFailureRateExceeded);
    assert!(matches!(
        err,
        PipelineError::UpgradeFailureRateExceeded { upgrade_id: 1, .. }
    ));
}

#[test]
fn missing_baseline_is_a_missing_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut raw: BTreeMap<UpgradeId, LazyFrame> = BTreeMap::new();
    raw.insert(1, baseline());
    let err = match ingest_results(raw, &covariates(), &settings(0.01), dir.path()) {
        Ok(_) => panic!("ingest without a baseline must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::MissingRequiredInput);
}

#[test]
fn cached_upgrades_reload_without_reingesting() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(
        reload_cached(dir.path(), &[0, 1]).expect("reload").is_none(),
        "an empty output dir has no cache"
    );

    let mut raw: BTreeMap<UpgradeId, LazyFrame> = BTreeMap::new();
    raw.insert(0, baseline());
    raw.insert(
        1,
        results(
            ["Success", "Success"],
            [Some(400.0), Some(250.0)],
            [Some(200.0), Some(90.0)],
            [Some(200.0), Some(160.0)],
        ),
    );
    ingest_results(raw, &covariates(), &settings(0.01), dir.path()).expect("ingest");

    let reloaded = reload_cached(dir.path(), &[1])
        .expect("reload")
        .expect("cache present after ingest");
    let df = reloaded.collect().expect("collect");
    assert_eq!(df.height(), 4);
}

#[test]
fn backfilled_column_with_another_dtype_is_a_schema_conflict() {
    let upgrade = df!(
        c::BUILDING_ID       => [1i64, 2],
        c::COMPLETION_STATUS => ["Success", "Invalid"],
        c::UPGRADE_NAME      => ["LED lighting", "LED lighting"],
        c::APPLICABILITY     => [true, false],
        HEATING              => [100.0f64, 200.0],
    )
    .expect("upgrade frame");
    let baseline = df!(
        c::BUILDING_ID => [1i64, 2],
        HEATING        => ["300", "200"],
    )
    .expect("baseline frame");

    let err = match backfill_from_baseline(upgrade, &baseline, 4) {
        Ok(_) => panic!("string baseline values cannot backfill a numeric column"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::SchemaConflict);
    match err {
        PipelineError::SchemaConflict { column, upgrade_id, .. } => {
            assert_eq!(column, HEATING);
            assert_eq!(upgrade_id, 4);
        }
        other => panic!("unexpected error {other}"),
    }
}
