//! CbecsRescaler: weighted floor area per building type is pulled onto the
//! reference survey, and the factor report lands on disk.

use polars::prelude::*;
use std::collections::BTreeMap;
use stockpost_core::{
    columns as c,
    error::ErrorKind,
    rescale_stage::{current_weighted_area, load_reference, rescale, write_factor_report},
};

fn fkt() -> LazyFrame {
    df!(
        c::BUILDING_ID => [1i64, 1, 2, 3],
        c::BLDG_TYPE   => ["SmallOffice", "SmallOffice", "Warehouse", "Hospital"],
        c::WEIGHT      => [1.0f64, 2.0, 4.0, 1.0],
    )
    .expect("fkt frame")
    .lazy()
}

fn simulated() -> LazyFrame {
    df!(
        c::BUILDING_ID => [1i64, 2, 3],
        c::FLR_AREA    => [1_000.0f64, 5_000.0, 100_000.0],
    )
    .expect("simulated frame")
    .lazy()
}

#[test]
fn rescaled_area_matches_the_reference() {
    let _ = env_logger::builder().is_test(true).try_init();
    let reference = BTreeMap::from([
        ("SmallOffice".to_string(), 3_600.0),
        ("Warehouse".to_string(), 18_000.0),
    ]);
    let (scaled, factors) = rescale(fkt(), &simulated(), &reference, [0.6, 1.3]).expect("rescale");

    assert_eq!(factors.len(), 2, "hospital has no reference and keeps its weights");
    let office = factors.iter().find(|f| f.building_type == "SmallOffice").expect("office");
    assert!((office.factor - 1.2).abs() < 1e-12);
    assert!(office.in_window);
    let warehouse = factors.iter().find(|f| f.building_type == "Warehouse").expect("warehouse");
    assert!((warehouse.factor - 0.9).abs() < 1e-12);

    let after = current_weighted_area(&scaled, &simulated()).expect("area after");
    assert!((after["SmallOffice"] - 3_600.0).abs() < 1e-6);
    assert!((after["Warehouse"] - 18_000.0).abs() < 1e-6);
    assert!((after["Hospital"] - 100_000.0).abs() < 1e-6);
}

#[test]
fn reference_file_round_trips_through_the_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reference_path = dir.path().join("reference.csv");
    std::fs::write(
        &reference_path,
        "building_type,weighted_sqft\nSmallOffice,2000\nSmallOffice,1600\nWarehouse,18000\n",
    )
    .expect("reference");
    let reference = load_reference(&reference_path).expect("load");
    assert_eq!(reference["SmallOffice"], 3_600.0, "rows for one type are summed");

    let (_, factors) = rescale(fkt(), &simulated(), &reference, [0.6, 1.3]).expect("rescale");
    let report = dir.path().join("diagnostics").join("rescale_factors.csv");
    write_factor_report(&report, &factors).expect("report");
    let text = std::fs::read_to_string(&report).expect("read report");
    assert!(text.starts_with("building_type,reference_sqft,current_sqft,factor,in_window"));
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn missing_reference_file_is_a_missing_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load_reference(&dir.path().join("absent.csv")).expect_err("no file");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredInput);
}

#[test]
fn type_with_no_simulated_area_cannot_be_rescaled() {
    let _ = env_logger::builder().is_test(true).try_init();
    let simulated = df!(
        c::BUILDING_ID => [1i64, 2, 3],
        c::FLR_AREA    => [1_000.0f64, 0.0, 100_000.0],
    )
    .expect("simulated frame")
    .lazy();
    let reference = BTreeMap::from([
        ("SmallOffice".to_string(), 3_600.0),
        ("Warehouse".to_string(), 18_000.0),
    ]);
    let err = match rescale(fkt(), &simulated, &reference, [0.6, 1.3]) {
        Ok(_) => panic!("warehouse weights cover no floor area"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::InvalidScalingFactor);
    assert!(err.to_string().contains("Warehouse"), "{err}");
}
