//! Canonical column names and the fixed fuel / end-use vocabulary.
//!
//! RULE: stages refer to columns through these constants and builders,
//! never through string literals of their own.

use crate::naming::{self, with_units};

// ── Identity ────────────────────────────────────────────────────────────────

pub const BUILDING_ID:        &str = "building_id";
pub const UPGRADE_ID:         &str = "upgrade_id";
pub const UPGRADE_NAME:       &str = "upgrade_name";
pub const APPLICABILITY:      &str = "applicability";
pub const COMPLETION_STATUS:  &str = "completion_status";
pub const VERIFIED_STATUS:    &str = "completion_status_verified";
pub const JOB_ID:             &str = "job_id";
pub const STARTED_AT:         &str = "started_at";
pub const COMPLETED_AT:       &str = "completed_at";
pub const REFERENCE_SCENARIO: &str = "reference_scenario";
pub const WEIGHT:             &str = "weight";
pub const DATASET:            &str = "dataset";
pub const MODELS_USED:        &str = "models_used";

/// Keys a covariate file may use for the building identifier.
pub const COVARIATE_ID_KEYS: [&str; 3] = ["sample_building_id", "Building", BUILDING_ID];

pub const BASELINE_NAME: &str = "Baseline";

// ── Building characteristics ────────────────────────────────────────────────

pub const FLR_AREA:          &str = "in.sqft..ft2";
pub const WTD_FLR_AREA:      &str = "calc.weighted.sqft..ft2";
pub const SAMPLING_REGION:   &str = "in.sampling_region_id";
pub const BLDG_TYPE:         &str = "in.comstock_building_type";
pub const BLDG_SUBTYPE:      &str = "in.building_subtype";
pub const BLDG_TYPE_GROUP:   &str = "in.comstock_building_type_group";
pub const SIZE_BIN:          &str = "in.size_bin_id";
pub const HVAC_SYSTEM:       &str = "in.hvac_system_type";
pub const HEATING_FUEL:      &str = "in.heating_fuel";
pub const YEAR_BUILT:        &str = "in.year_built";
pub const VINTAGE:           &str = "in.vintage";
pub const FLR_AREA_CATEGORY: &str = "in.floor_area_category";
pub const HVAC_CATEGORY:     &str = "in.hvac_category";
pub const HVAC_VENT_TYPE:    &str = "in.hvac_vent_type";
pub const HVAC_HEAT_TYPE:    &str = "in.hvac_heat_type";
pub const HVAC_COOL_TYPE:    &str = "in.hvac_cool_type";
pub const HVAC_COMBINED:     &str = "in.hvac_combined_type";
pub const SEGMENT:           &str = "calc.addressable_segment";

// ── Geography ───────────────────────────────────────────────────────────────

pub const TRACT:            &str = "in.nhgis_tract_gisjoin";
pub const COUNTY:           &str = "in.nhgis_county_gisjoin";
pub const PUMA:             &str = "in.nhgis_puma_gisjoin";
pub const STATE_ID:         &str = "in.state_fips";
pub const STATE:            &str = "in.state";
pub const STATE_NAME:       &str = "in.state_name";
pub const COUNTY_NAME:      &str = "in.county_name";
pub const CENSUS_REGION:    &str = "in.census_region_name";
pub const CENSUS_DIVISION:  &str = "in.census_division_name";
pub const CLIMATE_ZONE_RAW: &str = "in.climate_zone_source";
pub const ASHRAE_CZ:        &str = "in.ashrae_iecc_climate_zone_2006";
pub const GRID_REGION:      &str = "in.grid_region";
pub const UTILITY_ID:       &str = "in.electric_utility_eia_code";

// ── Environmental justice ───────────────────────────────────────────────────

pub const EJ_DISADVANTAGED:        &str = "in.cejst_is_disadvantaged";
pub const EJ_ENERGY_BURDEN_PCTILE: &str = "in.cejst_energy_burden_percentile";
pub const EJ_PM25_PCTILE:          &str = "in.cejst_pm25_percentile";
pub const EJ_LOW_INCOME_PCTILE:    &str = "in.cejst_low_income_percentile";

pub const EJ_PERCENTILE_COLUMNS: [&str; 3] = [
    EJ_ENERGY_BURDEN_PCTILE,
    EJ_PM25_PCTILE,
    EJ_LOW_INCOME_PCTILE,
];

// ── Fuels and end uses ──────────────────────────────────────────────────────

pub const ENERGY_UNITS: &str = "kwh";
pub const SITE_ENERGY:  &str = "site_energy";
pub const TOTAL:        &str = "total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fuel {
    Electricity,
    NaturalGas,
    OtherFuel,
    DistrictCooling,
    DistrictHeating,
}

impl Fuel {
    pub const ALL: [Fuel; 5] = [
        Fuel::Electricity,
        Fuel::NaturalGas,
        Fuel::OtherFuel,
        Fuel::DistrictCooling,
        Fuel::DistrictHeating,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Electricity     => "electricity",
            Self::NaturalGas      => "natural_gas",
            Self::OtherFuel       => "other_fuel",
            Self::DistrictCooling => "district_cooling",
            Self::DistrictHeating => "district_heating",
        }
    }

    /// End uses this fuel can serve in the simulation outputs.
    pub fn enduses(&self) -> &'static [&'static str] {
        match self {
            Self::Electricity => &ENDUSES,
            Self::NaturalGas | Self::OtherFuel => {
                &["heating", "cooling", "interior_equipment", "water_systems"]
            }
            Self::DistrictCooling => &["cooling"],
            Self::DistrictHeating => &["heating", "water_systems"],
        }
    }
}

pub const ENDUSES: [&str; 11] = [
    "heating",
    "cooling",
    "fans",
    "pumps",
    "heat_recovery",
    "heat_rejection",
    "interior_lighting",
    "exterior_lighting",
    "interior_equipment",
    "refrigeration",
    "water_systems",
];

/// End uses totalled across fuels.
pub const CROSS_FUEL_ENDUSES: [&str; 2] = ["heating", "cooling"];

/// Fixed end-use group membership. The groups partition ENDUSES.
pub const ENDUSE_GROUPS: [(&str, &[&str]); 5] = [
    ("hvac", &["cooling", "heating", "fans", "pumps", "heat_recovery", "heat_rejection"]),
    ("lighting", &["interior_lighting", "exterior_lighting"]),
    ("interior_equipment", &["interior_equipment"]),
    ("refrigeration", &["refrigeration"]),
    ("water_heating", &["water_systems"]),
];

/// `out.<fuel>.<enduse>.energy_consumption..kwh`
pub fn energy_col(fuel: &str, enduse: &str) -> String {
    with_units(
        &format!("out.{fuel}.{enduse}.energy_consumption"),
        Some(ENERGY_UNITS),
    )
}

pub fn fuel_total_col(fuel: Fuel) -> String {
    energy_col(fuel.name(), TOTAL)
}

pub fn site_total_col() -> String {
    energy_col(SITE_ENERGY, TOTAL)
}

/// `calc.enduse_group.<fuel>.<group>.energy_consumption..kwh`
pub fn enduse_group_col(fuel: &str, group: &str) -> String {
    with_units(
        &format!("calc.enduse_group.{fuel}.{group}.energy_consumption"),
        Some(ENERGY_UNITS),
    )
}

/// Every fuel-specific end-use column the pipeline expects.
pub fn expected_energy_cols() -> Vec<String> {
    let mut cols = Vec::new();
    for fuel in Fuel::ALL {
        for enduse in fuel.enduses() {
            cols.push(energy_col(fuel.name(), enduse));
        }
        cols.push(fuel_total_col(fuel));
    }
    cols.push(site_total_col());
    cols
}

// ── Peak demand and QOI ─────────────────────────────────────────────────────

pub const PEAK_DEMAND: &str = "out.electricity.total.peak_demand..kw";

pub const QOI_MAX_USE: [&str; 3] = [
    "out.qoi.maximum_daily_use_summer..kw",
    "out.qoi.maximum_daily_use_shoulder..kw",
    "out.qoi.maximum_daily_use_winter..kw",
];

pub const QOI_NORMALIZED_UNITS: &str = "w_per_ft2";

// ── Emissions ───────────────────────────────────────────────────────────────

pub const EMISSIONS_UNITS:       &str = "co2e_kg";
pub const EMISSIONS_TOTAL_UNITS: &str = "co2e_mmt";

pub const EMISSIONS_NATURAL_GAS:      &str = "out.emissions.natural_gas..co2e_kg";
pub const EMISSIONS_PROPANE:          &str = "out.emissions.propane..co2e_kg";
pub const EMISSIONS_FUEL_OIL:         &str = "out.emissions.fuel_oil..co2e_kg";
pub const EMISSIONS_DISTRICT_HEATING: &str = "out.emissions.district_heating..co2e_kg";

/// One grid-emissions scenario for electricity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmissionsScenario {
    pub name:        &'static str,
    pub electricity: &'static str,
    pub total:       &'static str,
}

pub const EMISSIONS_SCENARIOS: [EmissionsScenario; 2] = [
    EmissionsScenario {
        name:        "egrid",
        electricity: "out.emissions.electricity.egrid_2021_subregion..co2e_kg",
        total:       "calc.emissions.total_with_egrid..co2e_mmt",
    },
    EmissionsScenario {
        name:        "cambium",
        electricity: "out.emissions.electricity.lrmer_95_decarb_by_2035_15_2025_start..co2e_kg",
        total:       "calc.emissions.total_with_cambium..co2e_mmt",
    },
];

impl EmissionsScenario {
    /// The five fuel-specific emissions columns summed into the total.
    pub fn fuel_columns(&self) -> [&'static str; 5] {
        [
            self.electricity,
            EMISSIONS_NATURAL_GAS,
            EMISSIONS_PROPANE,
            EMISSIONS_FUEL_OIL,
            EMISSIONS_DISTRICT_HEATING,
        ]
    }
}

/// Fuels with emissions attributed to end-use groups, with the
/// emissions columns that make up the fuel's emissions.
pub fn fuel_emissions_sources(fuel: Fuel, scenario: &EmissionsScenario) -> Vec<&'static str> {
    match fuel {
        Fuel::Electricity     => vec![scenario.electricity],
        Fuel::NaturalGas      => vec![EMISSIONS_NATURAL_GAS],
        Fuel::OtherFuel       => vec![EMISSIONS_PROPANE, EMISSIONS_FUEL_OIL],
        Fuel::DistrictHeating => vec![EMISSIONS_DISTRICT_HEATING],
        Fuel::DistrictCooling => vec![],
    }
}

/// `calc.emissions.<fuel>.<group>[.<scenario>]..co2e_kg`. Only electricity
/// depends on the grid scenario.
pub fn enduse_group_emissions_col(fuel: Fuel, group: &str, scenario: &EmissionsScenario) -> String {
    let base = match fuel {
        Fuel::Electricity => format!("calc.emissions.{}.{group}.{}", fuel.name(), scenario.name),
        _ => format!("calc.emissions.{}.{group}", fuel.name()),
    };
    with_units(&base, Some(EMISSIONS_UNITS))
}

// ── Utility bills ───────────────────────────────────────────────────────────

pub const BILL_UNITS: &str = "usd";

/// A results column holding `|<utility>:<f1>:...:<f10>|` bundles.
pub const UTILITY_BUNDLE_COLUMNS: [(&str, &str); 1] = [
    ("electricity", "out.utility_bills.electricity_bill_results"),
];

/// Results columns holding `|<state>:<cost>|` bundles.
pub const STATE_AVERAGE_COLUMNS: [(&str, &str); 4] = [
    ("electricity", "out.utility_bills.electricity_bill_state_average_results"),
    ("natural_gas", "out.utility_bills.natural_gas_bill_state_average_results"),
    ("propane",     "out.utility_bills.propane_bill_state_average_results"),
    ("fuel_oil",    "out.utility_bills.fuel_oil_bill_state_average_results"),
];

/// The ten bundle fields: (suffix, is_cost).
pub const BILL_FIELDS: [(&str, bool); 10] = [
    ("min", true),
    ("min_label", false),
    ("max", true),
    ("max_label", false),
    ("median_low", true),
    ("median_low_label", false),
    ("median_high", true),
    ("median_high_label", false),
    ("mean", true),
    ("num_bills", false),
];

pub const STATE_AVERAGE_LABEL: &str = "state_average_rate";

/// `out.utility_bills.<fuel>_bill_<field>[..usd]`
pub fn bill_field_col(fuel: &str, field: &str, is_cost: bool) -> String {
    let base = format!("out.utility_bills.{fuel}_bill_{field}");
    if is_cost {
        with_units(&base, Some(BILL_UNITS))
    } else {
        base
    }
}

pub fn state_average_bill_col(fuel: &str) -> String {
    bill_field_col(fuel, "state_average", true)
}

pub fn total_bill_col() -> String {
    bill_field_col("total", "mean", true)
}

/// Every cost column the bill resolver produces.
pub fn bill_cost_cols() -> Vec<String> {
    let mut cols = Vec::new();
    for (fuel, _) in UTILITY_BUNDLE_COLUMNS {
        for (field, is_cost) in BILL_FIELDS {
            if is_cost {
                cols.push(bill_field_col(fuel, field, true));
            }
        }
    }
    for (fuel, _) in STATE_AVERAGE_COLUMNS {
        cols.push(state_average_bill_col(fuel));
    }
    cols.push(total_bill_col());
    cols
}

// ── Savings inputs ──────────────────────────────────────────────────────────

/// Value columns that get unweighted absolute and percent savings.
pub fn savings_source_cols() -> Vec<String> {
    let mut cols = expected_energy_cols();
    for enduse in CROSS_FUEL_ENDUSES {
        cols.push(energy_col(SITE_ENERGY, enduse));
    }
    for (group, _) in ENDUSE_GROUPS {
        for fuel in Fuel::ALL {
            cols.push(enduse_group_col(fuel.name(), group));
        }
        cols.push(enduse_group_col(SITE_ENERGY, group));
    }
    cols.push(PEAK_DEMAND.to_string());
    for scenario in EMISSIONS_SCENARIOS {
        for fuel_col in scenario.fuel_columns() {
            if !cols.iter().any(|c| c == fuel_col) {
                cols.push(fuel_col.to_string());
            }
        }
        cols.push(scenario.total.to_string());
    }
    cols
}

pub fn percent_savings_col(source: &str) -> crate::error::PipelineResult<String> {
    naming::col_name_to_percent_savings(source, "percent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enduse_groups_partition_enduses() {
        let mut members: Vec<&str> = ENDUSE_GROUPS
            .iter()
            .flat_map(|(_, m)| m.iter().copied())
            .collect();
        members.sort();
        let mut all = ENDUSES.to_vec();
        all.sort();
        assert_eq!(members, all);
    }

    #[test]
    fn savings_sources_have_savings_names() {
        for col in savings_source_cols() {
            assert!(
                naming::col_name_to_savings(&col).is_ok(),
                "no savings name for {col}"
            );
        }
    }
}
