//! Geography and environmental-justice enrichment.
//!
//! RULE: a frame is joined only to the columns its key uniquely determines.
//! A tract determines its county, but a county never determines a tract.

use crate::{
    columns::{self as c, EJ_PERCENTILE_COLUMNS},
    error::{PipelineError, PipelineResult},
    kernel,
    types::GeoKey,
};
use polars::prelude::*;
use std::path::Path;

const TRACT_REACHABLE: &[&str] = &[
    c::COUNTY,
    c::PUMA,
    c::STATE_ID,
    c::STATE,
    c::STATE_NAME,
    c::COUNTY_NAME,
    c::CENSUS_REGION,
    c::CENSUS_DIVISION,
    c::CLIMATE_ZONE_RAW,
    c::ASHRAE_CZ,
    c::GRID_REGION,
];

const COUNTY_REACHABLE: &[&str] = &[
    c::STATE_ID,
    c::STATE,
    c::STATE_NAME,
    c::COUNTY_NAME,
    c::CENSUS_REGION,
    c::CENSUS_DIVISION,
    c::CLIMATE_ZONE_RAW,
    c::ASHRAE_CZ,
];

const PUMA_REACHABLE: &[&str] = &[
    c::STATE_ID,
    c::STATE,
    c::STATE_NAME,
    c::CENSUS_REGION,
    c::CENSUS_DIVISION,
];

const STATE_REACHABLE: &[&str] = &[
    c::STATE_NAME,
    c::CENSUS_REGION,
    c::CENSUS_DIVISION,
];

impl GeoKey {
    /// Finest first.
    pub const ALL: [GeoKey; 4] = [GeoKey::Tract, GeoKey::County, GeoKey::Puma, GeoKey::State];

    pub fn column(&self) -> &'static str {
        match self {
            Self::Tract  => c::TRACT,
            Self::County => c::COUNTY,
            Self::Puma   => c::PUMA,
            Self::State  => c::STATE,
        }
    }

    /// Geography columns this key uniquely determines.
    pub fn reachable_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Tract  => TRACT_REACHABLE,
            Self::County => COUNTY_REACHABLE,
            Self::Puma   => PUMA_REACHABLE,
            Self::State  => STATE_REACHABLE,
        }
    }
}

/// The finest geography key among `columns`.
pub fn finest_key(columns: &[String]) -> Option<GeoKey> {
    GeoKey::ALL
        .into_iter()
        .find(|k| columns.iter().any(|n| n == k.column()))
}

/// Lookup tables keyed by tract.
#[derive(Debug, Clone)]
pub struct GeographyTables {
    pub lookup:                DataFrame,
    pub environmental_justice: Option<DataFrame>,
}

impl GeographyTables {
    pub fn load(lookup: &Path, environmental_justice: Option<&Path>) -> PipelineResult<Self> {
        let lookup = kernel::read_csv(lookup)?;
        let environmental_justice = match environmental_justice {
            Some(path) => Some(kernel::read_csv(path)?),
            None => None,
        };
        Ok(Self::new(lookup, environmental_justice))
    }

    pub fn new(lookup: DataFrame, environmental_justice: Option<DataFrame>) -> Self {
        Self {
            lookup,
            environmental_justice,
        }
    }

    fn lookup_columns(&self) -> Vec<String> {
        kernel::frame_column_names(&self.lookup)
    }
}

/// Join the columns reachable from `key` that the frame does not yet carry.
/// Tract joins also attach environmental-justice attributes with defaults.
pub fn enrich(lf: LazyFrame, key: GeoKey, tables: &GeographyTables) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&lf)?;
    let key_col = key.column();
    if !present.iter().any(|n| n == key_col) {
        return Err(PipelineError::ColumnMissing {
            column:  key_col.to_string(),
            context: "geography enrichment".to_string(),
        });
    }
    let available = tables.lookup_columns();
    fn has(list: &[String], name: &str) -> bool {
        list.iter().any(|n| n == name)
    }

    let wanted: Vec<&str> = key
        .reachable_columns()
        .iter()
        .copied()
        .filter(|name| !has(&present, *name) && has(&available, *name))
        .collect();

    let mut lf = lf.with_column(col(key_col).cast(DataType::String));
    if !wanted.is_empty() && has(&available, key_col) {
        let lookup = tables
            .lookup
            .clone()
            .lazy()
            .with_column(col(key_col).cast(DataType::String))
            .group_by([col(key_col)])
            .agg(wanted.iter().map(|w| col(*w).first()).collect::<Vec<_>>());
        lf = lf.join(lookup, [col(key_col)], [col(key_col)], JoinArgs::new(JoinType::Left));
        log::debug!("Joined {} geography column(s) on {key_col}", wanted.len());
    }

    if key == GeoKey::Tract {
        lf = attach_environmental_justice(lf, &present, tables.environmental_justice.as_ref())?;
    }
    Ok(lf)
}

fn attach_environmental_justice(
    lf: LazyFrame,
    present: &[String],
    table: Option<&DataFrame>,
) -> PipelineResult<LazyFrame> {
    let mut ej_cols = vec![c::EJ_DISADVANTAGED];
    ej_cols.extend(EJ_PERCENTILE_COLUMNS);
    let missing: Vec<&str> = ej_cols
        .into_iter()
        .filter(|n| !present.iter().any(|p| p == *n))
        .collect();
    if missing.is_empty() {
        return Ok(lf);
    }

    let table_cols = table.map(kernel::frame_column_names).unwrap_or_default();
    let joinable: Vec<&str> = missing
        .iter()
        .copied()
        .filter(|n| table_cols.iter().any(|t| t == *n))
        .collect();

    let mut lf = lf;
    if let (Some(table), false) = (table, joinable.is_empty()) {
        if !table_cols.iter().any(|t| t == c::TRACT) {
            return Err(PipelineError::ColumnMissing {
                column:  c::TRACT.to_string(),
                context: "environmental justice table".to_string(),
            });
        }
        let ej = table
            .clone()
            .lazy()
            .with_column(col(c::TRACT).cast(DataType::String))
            .group_by([col(c::TRACT)])
            .agg(joinable.iter().map(|n| col(*n).first()).collect::<Vec<_>>());
        lf = lf.join(ej, [col(c::TRACT)], [col(c::TRACT)], JoinArgs::new(JoinType::Left));
    }

    let defaults: Vec<Expr> = missing
        .iter()
        .map(|name| {
            let (fill, dtype) = if *name == c::EJ_DISADVANTAGED {
                (lit(false), DataType::Boolean)
            } else {
                (lit(0.0), DataType::Float64)
            };
            if joinable.contains(name) {
                col(*name).cast(dtype).fill_null(fill).alias(*name)
            } else {
                fill.cast(dtype).alias(*name)
            }
        })
        .collect();
    Ok(lf.with_columns(defaults))
}

/// Enrich on the finest key present; frames with no key pass through.
pub fn enrich_finest(lf: LazyFrame, tables: &GeographyTables) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&lf)?;
    match finest_key(&present) {
        Some(key) => enrich(lf, key, tables),
        None => {
            log::debug!("No geography key present; enrichment skipped");
            Ok(lf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn county_never_reaches_tract_level_columns() {
        assert!(!GeoKey::County.reachable_columns().contains(&c::PUMA));
        assert!(!GeoKey::State.reachable_columns().contains(&c::COUNTY));
        assert!(GeoKey::Tract.reachable_columns().contains(&c::COUNTY));
    }

    #[test]
    fn finest_key_prefers_tract() {
        let cols = vec![c::STATE.to_string(), c::TRACT.to_string()];
        assert_eq!(finest_key(&cols), Some(GeoKey::Tract));
        assert_eq!(finest_key(&[c::PUMA.to_string()]), Some(GeoKey::Puma));
        assert_eq!(finest_key(&[]), None);
    }
}
