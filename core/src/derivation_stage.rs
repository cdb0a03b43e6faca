//! DerivationEngine: registry renames, end-use and group totals,
//! intensities, classifications, emissions and unweighted savings.
//!
//! EXECUTION ORDER (each step may read columns made by earlier steps):
//!   1. Rename & convert units per the registry
//!   2. Dtype enforcement
//!   3. Zero-fill missing end-use energy and emissions columns
//!   4. End-use totals across fuels
//!   5. End-use group sums, per fuel then across fuels
//!   6. Intensity columns
//!   7. Normalized QOI columns
//!   8. HVAC metadata and addressable segments
//!   9. Building-type group, vintage, floor-area category
//!  10. Emissions totals per grid scenario
//!  11. End-use group emissions
//!  12. Unweighted savings versus the baseline
//!
//! RULE: every step is column-expression composition over the lazy frame.

use crate::{
    column_registry::{ColumnDefinition, ColumnRegistry, RenameStep},
    columns::{self as c, Fuel, CROSS_FUEL_ENDUSES, EMISSIONS_SCENARIOS, ENDUSE_GROUPS},
    config::WeightedUnits,
    error::{PipelineError, PipelineResult},
    kernel::{self, safe_divide, sum_exprs},
    naming,
    segments,
    types::{ColumnDataType, BASELINE_UPGRADE},
    units::conv_fact,
};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const BASELINE_SUFFIX: &str = "__baseline";

pub struct DerivationOutput {
    pub frame:               LazyFrame,
    /// Definitions for every column this stage created.
    pub derived:             Vec<ColumnDefinition>,
    /// Unweighted savings column → weighted savings column.
    pub savings_to_weighted: BTreeMap<String, String>,
}

/// Tracks the columns present in the plan and the definitions of new ones.
struct Catalog<'a> {
    registry: &'a ColumnRegistry,
    present:  BTreeSet<String>,
    derived:  Vec<ColumnDefinition>,
}

impl<'a> Catalog<'a> {
    fn has(&self, name: &str) -> bool {
        self.present.contains(name)
    }

    fn add(&mut self, name: &str, data_type: ColumnDataType, description: String, source: Option<&str>) {
        self.present.insert(name.to_string());
        if self.registry.contains(name) {
            return;
        }
        let source_def = source.and_then(|s| {
            self.registry
                .get(s)
                .or_else(|| self.derived.iter().find(|d| d.new_name_with_units() == s))
                .cloned()
        });
        self.derived.retain(|d| d.new_name_with_units() != name);
        self.derived
            .push(ColumnDefinition::derived(name, data_type, description, source_def.as_ref()));
    }
}

// ── 1. Rename ───────────────────────────────────────────────────────────────

/// Rename registered raw columns to their canonical names, scaling
/// numeric values by the unit conversion factor.
pub fn apply_rename_plan(lf: LazyFrame, steps: &[RenameStep]) -> PipelineResult<LazyFrame> {
    let names = kernel::column_names(&lf)?;
    let present: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let active: BTreeMap<&str, &RenameStep> = steps
        .iter()
        .filter(|s| present.contains(s.original.as_str()))
        .filter(|s| s.original != s.renamed || s.factor != 1.0)
        .map(|s| (s.original.as_str(), s))
        .collect();
    if active.is_empty() {
        return Ok(lf);
    }
    let targets: BTreeSet<&str> = active.values().map(|s| s.renamed.as_str()).collect();

    let mut exprs = Vec::with_capacity(names.len());
    for name in &names {
        match active.get(name.as_str()) {
            Some(step) if step.factor != 1.0 => exprs.push(
                (col(name.as_str()).cast(DataType::Float64) * lit(step.factor))
                    .alias(step.renamed.as_str()),
            ),
            Some(step) => exprs.push(col(name.as_str()).alias(step.renamed.as_str())),
            // A column already carrying a target name is superseded by the rename.
            None if targets.contains(name.as_str()) => {
                log::debug!("Column '{name}' replaced by a registry rename");
            }
            None => exprs.push(col(name.as_str())),
        }
    }
    log::debug!("Renamed {} column(s) per the registry", active.len());
    Ok(lf.select(exprs))
}

// ── 2-3. Dtypes and missing columns ─────────────────────────────────────────

fn require(cat: &Catalog, column: &str, context: &str) -> PipelineResult<()> {
    if cat.has(column) {
        Ok(())
    } else {
        Err(PipelineError::ColumnMissing {
            column:  column.to_string(),
            context: context.to_string(),
        })
    }
}

fn enforce_dtypes(lf: LazyFrame, cat: &Catalog) -> PipelineResult<LazyFrame> {
    require(cat, c::FLR_AREA, "dtype enforcement")?;
    let mut exprs = vec![
        col(c::UPGRADE_ID).cast(DataType::Int64),
        col(c::FLR_AREA).cast(DataType::Float64),
    ];
    if cat.has(c::YEAR_BUILT) {
        exprs.push(col(c::YEAR_BUILT).cast(DataType::String));
    }
    Ok(lf.with_columns(exprs))
}

fn zero_fill_missing(lf: LazyFrame, cat: &mut Catalog) -> LazyFrame {
    let mut expected = c::expected_energy_cols();
    for scenario in EMISSIONS_SCENARIOS {
        expected.extend(scenario.fuel_columns().iter().map(|s| s.to_string()));
    }
    let mut fills = Vec::new();
    for name in expected {
        if !cat.has(&name) {
            fills.push(lit(0.0).alias(name.as_str()));
            cat.add(&name, ColumnDataType::Number, "Not simulated; filled with zero".into(), None);
        }
    }
    if fills.is_empty() {
        return lf;
    }
    log::debug!("Zero-filled {} missing energy/emissions column(s)", fills.len());
    lf.with_columns(fills)
}

// ── 4-5. Totals and groups ──────────────────────────────────────────────────

fn fuel_enduse_col(fuel: Fuel, enduse: &str) -> Option<String> {
    fuel.enduses()
        .contains(&enduse)
        .then(|| c::energy_col(fuel.name(), enduse))
}

fn cross_fuel_totals(lf: LazyFrame, cat: &mut Catalog) -> LazyFrame {
    let mut exprs = Vec::new();
    for enduse in CROSS_FUEL_ENDUSES {
        let name = c::energy_col(c::SITE_ENERGY, enduse);
        let parts: Vec<Expr> = Fuel::ALL
            .iter()
            .filter_map(|f| fuel_enduse_col(*f, enduse))
            .map(|n| col(n.as_str()))
            .collect();
        exprs.push(sum_exprs(parts).alias(name.as_str()));
        cat.add(&name, ColumnDataType::Number, format!("Total {enduse} energy across all fuels"), None);
    }
    lf.with_columns(exprs)
}

fn enduse_groups(lf: LazyFrame, cat: &mut Catalog) -> LazyFrame {
    let mut per_fuel = Vec::new();
    for (group, members) in ENDUSE_GROUPS {
        for fuel in Fuel::ALL {
            let name = c::enduse_group_col(fuel.name(), group);
            let parts: Vec<Expr> = members
                .iter()
                .filter_map(|e| fuel_enduse_col(fuel, e))
                .map(|n| col(n.as_str()))
                .collect();
            per_fuel.push(sum_exprs(parts).alias(name.as_str()));
            cat.add(
                &name,
                ColumnDataType::Number,
                format!("{} energy for the {group} end-use group", fuel.name()),
                Some(&c::fuel_total_col(fuel)),
            );
        }
    }
    let mut overall = Vec::new();
    for (group, _) in ENDUSE_GROUPS {
        let name = c::enduse_group_col(c::SITE_ENERGY, group);
        let parts: Vec<Expr> = Fuel::ALL
            .iter()
            .map(|f| col(c::enduse_group_col(f.name(), group).as_str()))
            .collect();
        overall.push(sum_exprs(parts).alias(name.as_str()));
        cat.add(
            &name,
            ColumnDataType::Number,
            format!("Energy across all fuels for the {group} end-use group"),
            Some(&c::site_total_col()),
        );
    }
    lf.with_columns(per_fuel).with_columns(overall)
}

// ── 6-7. Intensities ────────────────────────────────────────────────────────

fn energy_columns(cat: &Catalog) -> Vec<String> {
    let mut cols: Vec<String> = c::expected_energy_cols();
    for enduse in CROSS_FUEL_ENDUSES {
        cols.push(c::energy_col(c::SITE_ENERGY, enduse));
    }
    for (group, _) in ENDUSE_GROUPS {
        for fuel in Fuel::ALL {
            cols.push(c::enduse_group_col(fuel.name(), group));
        }
        cols.push(c::enduse_group_col(c::SITE_ENERGY, group));
    }
    cols.retain(|n| cat.has(n));
    cols
}

fn intensities(lf: LazyFrame, cat: &mut Catalog) -> PipelineResult<LazyFrame> {
    let mut exprs = Vec::new();
    let mut sources: Vec<(String, String)> = Vec::new();
    for name in energy_columns(cat) {
        sources.push((naming::col_name_to_eui(&name)?, name));
    }
    let mut per_area: Vec<String> = vec![c::PEAK_DEMAND.to_string()];
    per_area.extend([
        c::EMISSIONS_NATURAL_GAS,
        c::EMISSIONS_PROPANE,
        c::EMISSIONS_FUEL_OIL,
        c::EMISSIONS_DISTRICT_HEATING,
    ].iter().map(|s| s.to_string()));
    per_area.extend(EMISSIONS_SCENARIOS.iter().map(|s| s.electricity.to_string()));
    for name in per_area.into_iter().filter(|n| cat.has(n)) {
        sources.push((naming::col_name_to_area_intensity(&name)?, name));
    }

    for (intensity, source) in sources {
        exprs.push(safe_divide(col(source.as_str()), col(c::FLR_AREA)).alias(intensity.as_str()));
        cat.add(
            &intensity,
            ColumnDataType::Number,
            format!("{source} per unit floor area"),
            Some(&source),
        );
    }
    Ok(lf.with_columns(exprs))
}

fn normalized_qoi(lf: LazyFrame, cat: &mut Catalog) -> PipelineResult<LazyFrame> {
    let mut exprs = Vec::new();
    let present: Vec<&str> = c::QOI_MAX_USE.iter().copied().filter(|q| cat.has(q)).collect();
    for qoi in present {
        let name = naming::col_name_to_normalized(qoi, c::QOI_NORMALIZED_UNITS)?;
        let factor = conv_fact(&naming::units_from_col_name(qoi), "w")?;
        exprs.push((safe_divide(col(qoi), col(c::FLR_AREA)) * lit(factor)).alias(name.as_str()));
        cat.add(&name, ColumnDataType::Number, format!("{qoi} normalized by floor area"), Some(qoi));
    }
    Ok(lf.with_columns(exprs))
}

// ── 8-9. Classifications ────────────────────────────────────────────────────

fn classifications(lf: LazyFrame, cat: &mut Catalog) -> PipelineResult<LazyFrame> {
    require(cat, c::BLDG_TYPE, "segment classification")?;
    let mut lf = segments::attach_hvac_metadata(lf)?;
    if !cat.has(c::BLDG_SUBTYPE) {
        lf = lf.with_column(lit(NULL).cast(DataType::String).alias(c::BLDG_SUBTYPE));
        cat.present.insert(c::BLDG_SUBTYPE.to_string());
    }
    for (name, description) in [
        (c::HVAC_CATEGORY, "HVAC system category"),
        (c::HVAC_VENT_TYPE, "HVAC ventilation type"),
        (c::HVAC_HEAT_TYPE, "HVAC primary heating type"),
        (c::HVAC_COOL_TYPE, "HVAC primary cooling type"),
        (c::HVAC_COMBINED, "Combined HVAC ventilation, heating and cooling type"),
    ] {
        cat.add(name, ColumnDataType::String, description.into(), Some(c::HVAC_SYSTEM));
    }

    let mut exprs = vec![
        segments::segment_expr(),
        segments::building_type_group_expr(),
        segments::floor_area_category_expr(),
    ];
    cat.add(c::SEGMENT, ColumnDataType::String, "Addressable market segment".into(), Some(c::BLDG_TYPE));
    cat.add(c::BLDG_TYPE_GROUP, ColumnDataType::String, "Building type group".into(), Some(c::BLDG_TYPE));
    cat.add(c::FLR_AREA_CATEGORY, ColumnDataType::String, "Floor area category".into(), Some(c::FLR_AREA));
    if cat.has(c::YEAR_BUILT) {
        exprs.push(segments::vintage_expr());
        cat.add(c::VINTAGE, ColumnDataType::String, "Vintage bin of year built".into(), Some(c::YEAR_BUILT));
    }
    Ok(lf.with_columns(exprs))
}

// ── 10-11. Emissions ────────────────────────────────────────────────────────

fn emissions_totals(lf: LazyFrame, cat: &mut Catalog) -> PipelineResult<LazyFrame> {
    let factor = conv_fact(c::EMISSIONS_UNITS, c::EMISSIONS_TOTAL_UNITS)?;
    let mut exprs = Vec::new();
    for scenario in EMISSIONS_SCENARIOS {
        let parts: Vec<Expr> = scenario.fuel_columns().iter().map(|n| col(*n)).collect();
        exprs.push((sum_exprs(parts) * lit(factor)).alias(scenario.total));
        cat.add(
            scenario.total,
            ColumnDataType::Number,
            format!("Total emissions with {} electricity emissions", scenario.name),
            Some(scenario.electricity),
        );
    }
    Ok(lf.with_columns(exprs))
}

/// `fuel emissions × group energy / fuel energy`, 0 when the fuel's energy is 0.
pub fn enduse_group_emissions_exprs() -> Vec<(String, Expr, String)> {
    let mut out: Vec<(String, Expr, String)> = Vec::new();
    for scenario in EMISSIONS_SCENARIOS.iter() {
        for fuel in Fuel::ALL {
            let sources = c::fuel_emissions_sources(fuel, scenario);
            if sources.is_empty() {
                continue;
            }
            let fuel_emissions = sum_exprs(sources.iter().map(|s| col(*s)).collect());
            let fuel_energy = col(c::fuel_total_col(fuel).as_str());
            for (group, _) in ENDUSE_GROUPS {
                let name = c::enduse_group_emissions_col(fuel, group, scenario);
                if out.iter().any(|(n, _, _)| *n == name) {
                    continue;
                }
                let share = safe_divide(
                    col(c::enduse_group_col(fuel.name(), group).as_str()),
                    fuel_energy.clone(),
                );
                out.push((
                    name.clone(),
                    (fuel_emissions.clone() * share).alias(name.as_str()),
                    sources[0].to_string(),
                ));
            }
        }
    }
    out
}

fn enduse_group_emissions(lf: LazyFrame, cat: &mut Catalog) -> LazyFrame {
    let mut exprs = Vec::new();
    for (name, expr, source) in enduse_group_emissions_exprs() {
        cat.add(&name, ColumnDataType::Number, "End-use group share of fuel emissions".into(), Some(&source));
        exprs.push(expr);
    }
    lf.with_columns(exprs)
}

// ── 12. Savings ─────────────────────────────────────────────────────────────

fn savings(
    lf: LazyFrame,
    cat: &mut Catalog,
    weighted_units: &WeightedUnits,
) -> PipelineResult<(LazyFrame, BTreeMap<String, String>)> {
    let sources: Vec<String> = c::savings_source_cols().into_iter().filter(|s| cat.has(s)).collect();
    let mut base_select = vec![col(c::BUILDING_ID)];
    base_select.extend(
        sources
            .iter()
            .map(|s| col(s.as_str()).alias(format!("{s}{BASELINE_SUFFIX}").as_str())),
    );
    let baseline = lf
        .clone()
        .filter(col(c::UPGRADE_ID).eq(lit(BASELINE_UPGRADE)))
        .select(base_select);
    let keep: Vec<Expr> = cat.present.iter().map(|n| col(n.as_str())).collect();
    let joined = lf.join(
        baseline,
        [col(c::BUILDING_ID)],
        [col(c::BUILDING_ID)],
        JoinArgs::new(JoinType::Left),
    );

    let percent = conv_fact("fraction", "percent")?;
    let is_baseline = || col(c::UPGRADE_ID).eq(lit(BASELINE_UPGRADE));
    let mut exprs = Vec::new();
    let mut to_weighted = BTreeMap::new();
    for source in &sources {
        let base = || col(format!("{source}{BASELINE_SUFFIX}").as_str());
        let diff = || base() - col(source.as_str());

        let abs_name = naming::col_name_to_savings(source)?;
        exprs.push(
            when(is_baseline())
                .then(lit(0.0))
                .otherwise(diff())
                .fill_null(lit(0.0))
                .alias(abs_name.as_str()),
        );
        cat.add(&abs_name, ColumnDataType::Number, format!("Savings in {source} versus the baseline"), Some(source));

        let pct_name = c::percent_savings_col(source)?;
        exprs.push(
            when(is_baseline().or(base().eq(lit(0.0))))
                .then(lit(0.0))
                .otherwise(diff() / base() * lit(percent))
                .fill_nan(lit(0.0))
                .fill_null(lit(0.0))
                .alias(pct_name.as_str()),
        );
        cat.add(&pct_name, ColumnDataType::Number, format!("Percent savings in {source} versus the baseline"), Some(source));

        let units = naming::units_from_col_name(source);
        if let Some(target) = weighted_units.target_for(&units) {
            let weighted = naming::col_name_to_weighted_savings(&abs_name, Some(target))?;
            to_weighted.insert(abs_name, weighted);
        }
    }
    let mut select = keep;
    select.extend(exprs);
    Ok((joined.select(select), to_weighted))
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Run every derivation step over the ingested frame.
pub fn derive(
    lf: LazyFrame,
    registry: &ColumnRegistry,
    weighted_units: &WeightedUnits,
) -> PipelineResult<DerivationOutput> {
    let lf = apply_rename_plan(lf, &registry.rename_plan()?)?;
    let mut cat = Catalog {
        registry,
        present: kernel::column_names(&lf)?.into_iter().collect(),
        derived: Vec::new(),
    };

    let lf = enforce_dtypes(lf, &cat)?;
    let lf = zero_fill_missing(lf, &mut cat);
    let lf = cross_fuel_totals(lf, &mut cat);
    let lf = enduse_groups(lf, &mut cat);
    let lf = intensities(lf, &mut cat)?;
    let lf = normalized_qoi(lf, &mut cat)?;
    let lf = classifications(lf, &mut cat)?;
    segments::check_segments(&lf)?;
    let lf = emissions_totals(lf, &mut cat)?;
    let lf = enduse_group_emissions(lf, &mut cat);
    let (lf, savings_to_weighted) = savings(lf, &mut cat, weighted_units)?;

    log::info!(
        "Derivation added {} column(s), {} weighted savings mapping(s)",
        cat.derived.len(),
        savings_to_weighted.len()
    );
    Ok(DerivationOutput {
        frame: lf,
        derived: cat.derived,
        savings_to_weighted,
    })
}
