//! Rescale FKT weights so each building type's weighted floor area matches
//! the reference survey.
//!
//! factor(type) = reference_weighted_sqft / Σ(weight × sim_sqft)
//!
//! RULES:
//!   - A NaN or infinite factor is fatal (InvalidScalingFactor).
//!   - A factor outside the configured window is only a warning.
//!   - Types missing from the reference keep their weights.

use crate::{
    columns as c,
    error::{PipelineError, PipelineResult},
    kernel,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SIM_SQFT: &str = "__sim_sqft";
const WEIGHTED_SQFT: &str = "__weighted_sqft";

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    building_type: String,
    weighted_sqft: f64,
}

/// One building type's rescale, as written to the diagnostics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactor {
    pub building_type:  String,
    pub reference_sqft: f64,
    pub current_sqft:   f64,
    pub factor:         f64,
    pub in_window:      bool,
}

/// Reference weighted floor area per building type.
pub fn load_reference(path: &Path) -> PipelineResult<BTreeMap<String, f64>> {
    if !path.exists() {
        return Err(PipelineError::missing_input(path));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut reference = BTreeMap::new();
    for row in reader.deserialize::<ReferenceRow>() {
        let row = row?;
        *reference.entry(row.building_type.trim().to_string()).or_insert(0.0) += row.weighted_sqft;
    }
    log::debug!("Reference floor area loaded for {} building type(s)", reference.len());
    Ok(reference)
}

/// Current weighted floor area per building type: Σ(weight × sim_sqft).
pub fn current_weighted_area(fkt: &LazyFrame, simulated: &LazyFrame) -> PipelineResult<BTreeMap<String, f64>> {
    let present = kernel::column_names(fkt)?;
    if !present.iter().any(|n| n == c::BLDG_TYPE) {
        return Err(PipelineError::ColumnMissing {
            column:  c::BLDG_TYPE.to_string(),
            context: "rescale (FKT)".to_string(),
        });
    }
    let areas = simulated
        .clone()
        .select([col(c::BUILDING_ID), col(c::FLR_AREA).cast(DataType::Float64).alias(SIM_SQFT)]);
    let summed = fkt
        .clone()
        .select([col(c::BUILDING_ID), col(c::BLDG_TYPE), col(c::WEIGHT)])
        .join(areas, [col(c::BUILDING_ID)], [col(c::BUILDING_ID)], JoinArgs::new(JoinType::Left))
        .group_by([col(c::BLDG_TYPE)])
        .agg([(col(c::WEIGHT) * col(SIM_SQFT).fill_null(lit(0.0))).sum().alias(WEIGHTED_SQFT)]);
    let df = kernel::materialize(summed, "rescale weighted area")?;

    let types = kernel::str_values(&df, c::BLDG_TYPE, "rescale")?;
    let sums = kernel::f64_values(&df, WEIGHTED_SQFT, "rescale")?;
    Ok(types
        .into_iter()
        .zip(sums)
        .filter_map(|(t, s)| Some((t?, s.unwrap_or(0.0))))
        .collect())
}

/// Factor per building type present in both tables.
pub fn scaling_factors(
    reference: &BTreeMap<String, f64>,
    current: &BTreeMap<String, f64>,
    window: [f64; 2],
) -> PipelineResult<Vec<ScalingFactor>> {
    let mut factors = Vec::with_capacity(current.len());
    for (building_type, current_sqft) in current {
        let Some(reference_sqft) = reference.get(building_type).copied() else {
            log::warn!("No reference floor area for building type '{building_type}'; weights unchanged");
            continue;
        };
        let factor = reference_sqft / current_sqft;
        if !factor.is_finite() {
            return Err(PipelineError::InvalidScalingFactor {
                building_type: building_type.clone(),
                factor,
            });
        }
        let in_window = factor >= window[0] && factor <= window[1];
        if !in_window {
            log::warn!(
                "Rescale factor {factor:.3} for '{building_type}' outside [{}, {}]",
                window[0],
                window[1]
            );
        }
        factors.push(ScalingFactor {
            building_type: building_type.clone(),
            reference_sqft,
            current_sqft: *current_sqft,
            factor,
            in_window,
        });
    }
    for building_type in reference.keys().filter(|t| !current.contains_key(*t)) {
        log::warn!("Reference building type '{building_type}' has no simulated floor area");
    }
    Ok(factors)
}

/// Multiply each row's weight by its building type's factor.
pub fn apply_factors(fkt: LazyFrame, factors: &[ScalingFactor]) -> LazyFrame {
    let mut factor = lit(1.0);
    for f in factors.iter().rev() {
        factor = when(col(c::BLDG_TYPE).eq(lit(f.building_type.as_str())))
            .then(lit(f.factor))
            .otherwise(factor);
    }
    fkt.with_column((col(c::WEIGHT) * factor).alias(c::WEIGHT))
}

/// Compute and apply the rescale in one step.
pub fn rescale(
    fkt: LazyFrame,
    simulated: &LazyFrame,
    reference: &BTreeMap<String, f64>,
    window: [f64; 2],
) -> PipelineResult<(LazyFrame, Vec<ScalingFactor>)> {
    let current = current_weighted_area(&fkt, simulated)?;
    let factors = scaling_factors(reference, &current, window)?;
    log::info!("Rescaled weights for {} building type(s)", factors.len());
    Ok((apply_factors(fkt, &factors), factors))
}

/// `<diagnostics>/rescale_factors.csv`
pub fn write_factor_report(path: &Path, factors: &[ScalingFactor]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in factors {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_current_area_is_invalid() {
        let reference = BTreeMap::from([("Warehouse".to_string(), 100.0)]);
        let current = BTreeMap::from([("Warehouse".to_string(), 0.0)]);
        let err = scaling_factors(&reference, &current, [0.6, 1.3]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidScalingFactor { .. }));
    }

    #[test]
    fn out_of_window_factor_is_kept() {
        let reference = BTreeMap::from([("Warehouse".to_string(), 300.0)]);
        let current = BTreeMap::from([("Warehouse".to_string(), 100.0)]);
        let factors = scaling_factors(&reference, &current, [0.6, 1.3]).unwrap();
        assert_eq!(factors[0].factor, 3.0);
        assert!(!factors[0].in_window);
    }
}
