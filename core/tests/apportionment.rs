//! Apportioner: stratified draws, shortfall reporting, the FKT cache and
//! seed determinism.

use polars::prelude::*;
use std::collections::BTreeSet;
use stockpost_core::{
    apportionment_stage::{apportion, fkt_from_sample, ApportionmentSettings, BOOTSTRAP_COEFFICIENT},
    columns as c,
    kernel,
    rng::{RngBank, StageSlot},
};

fn simulated() -> LazyFrame {
    df!(
        c::BUILDING_ID     => [1i64, 2, 3, 4, 5],
        c::SAMPLING_REGION => ["R1", "R1", "R1", "R1", "R2"],
        c::BLDG_TYPE       => ["SmallOffice", "SmallOffice", "SmallOffice", "SmallOffice", "Warehouse"],
        c::SIZE_BIN        => [2i64, 2, 2, 2, 5],
        c::HVAC_SYSTEM     => ["PSZ-AC", "PSZ-AC", "PSZ-AC", "PSZ-AC", "Unit heaters"],
        c::HEATING_FUEL    => ["Electricity", "Electricity", "Electricity", "Electricity", "NaturalGas"],
        c::FLR_AREA        => [10_000.0f64, 10_000.0, 10_000.0, 10_000.0, 50_000.0],
    )
    .expect("simulated frame")
    .lazy()
}

/// Seven truth rows for the R1 small-office bucket, plus one row in a
/// bucket no simulated building covers.
fn truth() -> LazyFrame {
    let n = 8;
    let mut regions = vec!["R1"; n - 1];
    regions.push("R3");
    let mut types = vec!["SmallOffice"; n - 1];
    types.push("Hospital");
    df!(
        c::SAMPLING_REGION     => regions,
        c::BLDG_TYPE           => types,
        c::SIZE_BIN            => vec![2i64; n],
        c::HVAC_SYSTEM         => vec!["PSZ-AC"; n],
        c::HEATING_FUEL        => vec!["Electricity"; n],
        c::TRACT               => (0..n).map(|i| format!("G08000100{i:04}")).collect::<Vec<_>>(),
        c::STATE_ID            => vec!["8"; n],
        c::CLIMATE_ZONE_RAW    => vec!["5B"; n],
        c::FLR_AREA            => vec![20_000.0f64; n],
        BOOTSTRAP_COEFFICIENT  => vec![2.0f64; n],
    )
    .expect("truth frame")
    .lazy()
}

fn settings(seed: u64, reload: bool) -> ApportionmentSettings {
    ApportionmentSettings {
        seed,
        drop_micro_schools: true,
        reload_from_cache:  reload,
        input_digest:       "0123456789abcdef".to_string(),
    }
}

fn draws(fkt: &DataFrame) -> Vec<i64> {
    kernel::i64_values(fkt, c::BUILDING_ID, "test")
        .expect("building ids")
        .into_iter()
        .map(|v| v.expect("building id"))
        .collect()
}

#[test]
fn bucket_gets_one_draw_per_truth_row() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = RngBank::new(42).for_stage(StageSlot::Apportionment);
    let out = apportion(simulated(), truth(), &settings(42, false), dir.path(), &mut rng)
        .expect("apportion");
    let fkt = out.fkt.collect().expect("collect");

    assert_eq!(fkt.height(), 7, "seven truth rows, seven assignments");
    let pool: BTreeSet<i64> = [1, 2, 3, 4].into();
    for id in draws(&fkt) {
        assert!(pool.contains(&id), "drew building {id} from outside the bucket");
    }
    for stratifier in [c::SAMPLING_REGION, c::BLDG_TYPE, c::HVAC_SYSTEM, c::HEATING_FUEL] {
        let values: BTreeSet<Option<String>> = kernel::str_values(&fkt, stratifier, "test")
            .expect(stratifier)
            .into_iter()
            .collect();
        assert_eq!(values.len(), 1, "{stratifier} must be shared by the whole bucket");
    }

    let weights = kernel::f64_values(&fkt, c::WEIGHT, "test").expect("weights");
    for w in weights {
        let w = w.expect("weight");
        assert!((w - 1.0).abs() < 1e-12, "20000 / (10000 x 2.0) = 1.0, got {w}");
    }

    let states = kernel::str_values(&fkt, c::STATE, "test").expect("states");
    assert!(states.iter().all(|s| s.as_deref() == Some("CO")));
    let zones = kernel::str_values(&fkt, c::ASHRAE_CZ, "test").expect("zones");
    assert!(zones.iter().all(|z| z.as_deref() == Some("5B")));
}

#[test]
fn uncovered_bucket_is_reported_not_drawn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = RngBank::new(42).for_stage(StageSlot::Apportionment);
    let out = apportion(simulated(), truth(), &settings(42, false), dir.path(), &mut rng)
        .expect("apportion");
    assert_eq!(out.shortfalls.len(), 1);
    let shortfall = &out.shortfalls[0];
    assert_eq!(shortfall.truth_rows, 1);
    assert_eq!(shortfall.truth_sqft, 20_000.0);
    assert!(shortfall.bucket.starts_with("R3|Hospital|"));
}

#[test]
fn same_seed_same_fkt() {
    let first_dir = tempfile::tempdir().expect("tempdir");
    let second_dir = tempfile::tempdir().expect("tempdir");
    let run = |dir: &std::path::Path| {
        let mut rng = RngBank::new(7).for_stage(StageSlot::Apportionment);
        let out = apportion(simulated(), truth(), &settings(7, false), dir, &mut rng)
            .expect("apportion");
        draws(&out.fkt.collect().expect("collect"))
    };
    assert_eq!(run(first_dir.path()), run(second_dir.path()));
}

#[test]
fn cached_fkt_is_reused_for_the_same_seed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = RngBank::new(3).for_stage(StageSlot::Apportionment);
    let first = apportion(simulated(), truth(), &settings(3, true), dir.path(), &mut rng)
        .expect("first apportion");
    assert!(!first.reloaded);
    assert!(first.cache_path.exists());
    let first_draws = draws(&first.fkt.collect().expect("collect"));

    // A fresh stream from another seed would draw differently; the cache wins.
    let mut other = RngBank::new(999).for_stage(StageSlot::Apportionment);
    let second = apportion(simulated(), truth(), &settings(3, true), dir.path(), &mut other)
        .expect("second apportion");
    assert!(second.reloaded);
    assert_eq!(draws(&second.fkt.collect().expect("collect")), first_draws);

    let fresh = kernel::fkt_cache_path(dir.path(), 4, "0123456789abcdef");
    assert!(!fresh.exists(), "a different seed must not share the cache path");
}

#[test]
fn changed_inputs_redraw_instead_of_reloading() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = RngBank::new(3).for_stage(StageSlot::Apportionment);
    let first = apportion(simulated(), truth(), &settings(3, true), dir.path(), &mut rng)
        .expect("first apportion");
    assert!(!first.reloaded);

    let mut changed = settings(3, true);
    changed.input_digest = "fedcba9876543210".to_string();
    let mut rng = RngBank::new(3).for_stage(StageSlot::Apportionment);
    let second = apportion(simulated(), truth(), &changed, dir.path(), &mut rng)
        .expect("second apportion");
    assert!(!second.reloaded, "a new input digest must not reuse the cached draws");
    assert_ne!(second.cache_path, first.cache_path);
    assert!(second.cache_path.exists());
}

#[test]
fn sample_fkt_has_unit_weights() {
    let fkt = fkt_from_sample(simulated()).expect("sample fkt");
    let df = fkt.collect().expect("collect");
    assert_eq!(df.height(), 5);
    let weights = kernel::f64_values(&df, c::WEIGHT, "test").expect("weights");
    assert!(weights.iter().all(|w| *w == Some(1.0)));
}
