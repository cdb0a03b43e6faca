//! DerivationEngine: intensities, group sums, emissions and savings over a
//! small ingested frame.

use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use stockpost_core::{
    column_registry::{ColumnDefinition, ColumnRegistry},
    columns::{self as c, Fuel, EMISSIONS_SCENARIOS, ENDUSE_GROUPS},
    config::WeightedUnits,
    derivation_stage::{derive, DerivationOutput},
    error::ErrorKind,
    kernel,
    naming,
    types::{ColumnDataType, ColumnOrigin},
    units::conv_fact,
};

const GAS_HEATING: &str = "out.natural_gas.heating.energy_consumption..kwh";
const ELEC_COOLING: &str = "out.electricity.cooling.energy_consumption..kwh";

fn registry(definitions: Vec<ColumnDefinition>) -> ColumnRegistry {
    ColumnRegistry::from_definitions(definitions, BTreeMap::new(), false, 10).expect("registry")
}

/// Building 1 in the baseline and one upgrade that halves its gas heating.
fn ingested() -> LazyFrame {
    df!(
        c::BUILDING_ID   => [1i64, 1],
        c::UPGRADE_ID    => [0i64, 1],
        c::FLR_AREA      => [1_000.0f64, 1_000.0],
        c::BLDG_TYPE     => ["SmallOffice", "SmallOffice"],
        c::HVAC_SYSTEM   => ["PSZ-AC with gas coil", "PSZ-AC with gas coil"],
        c::YEAR_BUILT    => [1985i64, 1985],
        GAS_HEATING      => [100_000.0f64, 50_000.0],
        ELEC_COOLING     => [20_000.0f64, 20_000.0],
        c::fuel_total_col(Fuel::NaturalGas).as_str()  => [100_000.0f64, 50_000.0],
        c::fuel_total_col(Fuel::Electricity).as_str() => [20_000.0f64, 20_000.0],
        c::site_total_col().as_str()                  => [120_000.0f64, 70_000.0],
        c::EMISSIONS_NATURAL_GAS                      => [18_000.0f64, 9_000.0],
    )
    .expect("ingested frame")
    .lazy()
}

fn run(lf: LazyFrame) -> (DerivationOutput, DataFrame) {
    let _ = env_logger::builder().is_test(true).try_init();
    let output = derive(lf, &registry(Vec::new()), &WeightedUnits::default()).expect("derive");
    let df = kernel::sort_frame(
        output.frame.clone().collect().expect("collect"),
        &[c::UPGRADE_ID.to_string()],
    )
    .expect("sort");
    (output, df)
}

fn values(df: &DataFrame, name: &str) -> Vec<f64> {
    kernel::f64_values(df, name, "test")
        .expect(name)
        .into_iter()
        .map(|v| v.expect("non-null value"))
        .collect()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

#[test]
fn eui_divides_energy_by_floor_area() {
    let (_, df) = run(ingested());
    let eui = naming::col_name_to_eui(GAS_HEATING).expect("eui name");
    assert_eq!(eui, "out.natural_gas.heating.energy_consumption_intensity..kwh_per_ft2");
    let eui = values(&df, &eui);
    assert!(close(eui[0], 100.0), "baseline EUI was {}", eui[0]);
    assert!(close(eui[1], 50.0), "upgrade EUI was {}", eui[1]);
}

#[test]
fn end_use_groups_sum_their_members() {
    let (_, df) = run(ingested());
    let hvac_gas = values(&df, &c::enduse_group_col("natural_gas", "hvac"));
    let hvac_all = values(&df, &c::enduse_group_col(c::SITE_ENERGY, "hvac"));
    let heating_all = values(&df, &c::energy_col(c::SITE_ENERGY, "heating"));
    assert!(close(hvac_gas[0], 100_000.0));
    assert!(close(hvac_all[0], 120_000.0), "hvac across fuels was {}", hvac_all[0]);
    assert!(close(heating_all[0], 100_000.0));

    let lighting = values(&df, &c::enduse_group_col(c::SITE_ENERGY, "lighting"));
    assert_eq!(lighting, vec![0.0, 0.0], "unsimulated end uses are zero-filled");
}

#[test]
fn savings_are_zero_on_the_baseline_and_difference_on_upgrades() {
    let (output, df) = run(ingested());
    let savings = naming::col_name_to_savings(GAS_HEATING).expect("savings name");
    let pct = c::percent_savings_col(GAS_HEATING).expect("percent name");
    let abs = values(&df, &savings);
    let rel = values(&df, &pct);
    assert_eq!(abs[0], 0.0);
    assert!(close(abs[1], 50_000.0), "absolute savings were {}", abs[1]);
    assert_eq!(rel[0], 0.0);
    assert!(close(rel[1], 50.0), "percent savings were {}", rel[1]);

    let weighted = output
        .savings_to_weighted
        .get(&savings)
        .expect("weighted savings mapping");
    assert_eq!(
        weighted,
        "calc.weighted.savings.natural_gas.heating.energy_savings..tbtu"
    );
}

#[test]
fn unchanged_end_use_has_zero_savings() {
    let (_, df) = run(ingested());
    let savings = naming::col_name_to_savings(ELEC_COOLING).expect("savings name");
    assert_eq!(values(&df, &savings), vec![0.0, 0.0]);
}

#[test]
fn emissions_totals_are_in_million_metric_tons() {
    let (_, df) = run(ingested());
    for scenario in EMISSIONS_SCENARIOS {
        let total = values(&df, scenario.total);
        assert!(close(total[0], 18_000.0 * 1.0e-9), "{} total was {}", scenario.name, total[0]);
    }
}

#[test]
fn group_emissions_are_zero_when_fuel_energy_is_zero() {
    let (_, df) = run(ingested());
    let scenario = &EMISSIONS_SCENARIOS[0];
    let propane_hvac = values(&df, &c::enduse_group_emissions_col(Fuel::OtherFuel, "hvac", scenario));
    assert_eq!(propane_hvac, vec![0.0, 0.0]);

    let gas_hvac = values(&df, &c::enduse_group_emissions_col(Fuel::NaturalGas, "hvac", scenario));
    assert!(close(gas_hvac[0], 18_000.0), "all gas energy is hvac, so all gas emissions are");
}

#[test]
fn classifications_are_attached() {
    let (output, df) = run(ingested());
    let segments = kernel::str_values(&df, c::SEGMENT, "test").expect("segments");
    assert_eq!(segments[0].as_deref(), Some("Segment B"));
    let vintage = kernel::str_values(&df, c::VINTAGE, "test").expect("vintage");
    assert!(vintage[0].is_some(), "year built 1985 falls in a vintage bin");

    let derived: HashMap<String, &ColumnDefinition> = output
        .derived
        .iter()
        .map(|d| (d.new_name_with_units(), d))
        .collect();
    let segment = derived.get(c::SEGMENT).expect("segment definition");
    assert_eq!(segment.origin, ColumnOrigin::Derived);
    assert_eq!(segment.data_type, ColumnDataType::String);
}

#[test]
fn registry_rename_converts_units() {
    let definitions = vec![ColumnDefinition {
        origin:         ColumnOrigin::SimulationOutput,
        original_name:  "raw.gas_heating_kbtu".into(),
        new_name:       naming::strip_units(GAS_HEATING).into(),
        original_units: Some("kbtu".into()),
        new_units:      Some("kwh".into()),
        data_type:      ColumnDataType::Number,
        description:    "Natural gas heating".into(),
        basic:          true,
        full:           true,
        detailed:       true,
    }];
    let lf = df!(
        c::BUILDING_ID           => [1i64],
        c::UPGRADE_ID            => [0i64],
        c::FLR_AREA              => [1_000.0f64],
        c::BLDG_TYPE             => ["SmallOffice"],
        c::HVAC_SYSTEM           => ["PSZ-AC with gas coil"],
        "raw.gas_heating_kbtu"   => [3_412.141_633f64],
    )
    .expect("raw frame")
    .lazy();

    let output = derive(lf, &registry(definitions), &WeightedUnits::default()).expect("derive");
    let df = output.frame.collect().expect("collect");
    let heating = values(&df, GAS_HEATING);
    assert!(close(heating[0], 1_000.0), "3412.14 kBtu is 1000 kWh, got {}", heating[0]);
    assert!(df.column("raw.gas_heating_kbtu").is_err(), "raw name must be gone");
}

#[test]
fn missing_hvac_system_is_reported() {
    let lf = df!(
        c::BUILDING_ID => [1i64],
        c::UPGRADE_ID  => [0i64],
        c::FLR_AREA    => [1_000.0f64],
        c::BLDG_TYPE   => ["SmallOffice"],
    )
    .expect("frame")
    .lazy();
    let err = match derive(lf, &registry(Vec::new()), &WeightedUnits::default()) {
        Ok(_) => panic!("derivation without an HVAC system column must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::ColumnMissing);
}

/// Every fuel simulates every end use it can serve, with distinct values,
/// and every emissions column is populated.
fn fully_simulated() -> LazyFrame {
    let mut columns = vec![
        Column::new(c::BUILDING_ID.into(), [1i64]),
        Column::new(c::UPGRADE_ID.into(), [0i64]),
        Column::new(c::FLR_AREA.into(), [2_000.0f64]),
        Column::new(c::BLDG_TYPE.into(), ["SmallOffice"]),
        Column::new(c::HVAC_SYSTEM.into(), ["PSZ-AC with gas coil"]),
    ];
    let mut site = 0.0;
    for (f, fuel) in Fuel::ALL.iter().enumerate() {
        let mut total = 0.0;
        for (e, enduse) in fuel.enduses().iter().enumerate() {
            let value = 1_000.0 * (f + 1) as f64 + 10.0 * (e + 1) as f64;
            total += value;
            columns.push(Column::new(c::energy_col(fuel.name(), enduse).into(), [value]));
        }
        site += total;
        columns.push(Column::new(c::fuel_total_col(*fuel).into(), [total]));
    }
    columns.push(Column::new(c::site_total_col().into(), [site]));
    let mut emissions: Vec<&str> = Vec::new();
    for scenario in &EMISSIONS_SCENARIOS {
        for name in scenario.fuel_columns() {
            if !emissions.contains(&name) {
                emissions.push(name);
            }
        }
    }
    for (i, name) in emissions.iter().enumerate() {
        columns.push(Column::new((*name).into(), [500.0 * (i + 1) as f64]));
    }
    DataFrame::new(columns).expect("fully simulated frame").lazy()
}

#[test]
fn end_use_groups_partition_every_fuel_total() {
    let (_, df) = run(fully_simulated());
    for fuel in Fuel::ALL {
        let total = values(&df, &c::fuel_total_col(fuel))[0];
        let grouped: f64 = ENDUSE_GROUPS
            .iter()
            .map(|(group, _)| values(&df, &c::enduse_group_col(fuel.name(), group))[0])
            .sum();
        assert!(close(grouped, total), "{}: groups sum to {grouped}, total is {total}", fuel.name());
    }
    let site = values(&df, &c::site_total_col())[0];
    let grouped: f64 = ENDUSE_GROUPS
        .iter()
        .map(|(group, _)| values(&df, &c::enduse_group_col(c::SITE_ENERGY, group))[0])
        .sum();
    assert!(close(grouped, site), "site groups sum to {grouped}, total is {site}");
}

#[test]
fn group_emissions_add_up_to_fuel_and_scenario_totals() {
    let (_, df) = run(fully_simulated());
    let to_kg = 1.0 / conv_fact(c::EMISSIONS_UNITS, c::EMISSIONS_TOTAL_UNITS).expect("factor");
    for scenario in &EMISSIONS_SCENARIOS {
        let mut all_groups = 0.0;
        for fuel in Fuel::ALL {
            let sources = c::fuel_emissions_sources(fuel, scenario);
            if sources.is_empty() {
                continue;
            }
            let fuel_emissions: f64 = sources.iter().map(|s| values(&df, s)[0]).sum();
            let grouped: f64 = ENDUSE_GROUPS
                .iter()
                .map(|(group, _)| values(&df, &c::enduse_group_emissions_col(fuel, group, scenario))[0])
                .sum();
            assert!(
                close(grouped, fuel_emissions),
                "{} {}: groups {grouped}, fuel {fuel_emissions}",
                scenario.name,
                fuel.name()
            );
            all_groups += grouped;
        }
        let wide: f64 = scenario.fuel_columns().iter().map(|n| values(&df, n)[0]).sum();
        let total = values(&df, scenario.total)[0] * to_kg;
        assert!(close(all_groups, wide), "{}: long {all_groups}, wide {wide}", scenario.name);
        assert!(close(wide, total), "{}: wide {wide}, configured total {total}", scenario.name);
    }
}
