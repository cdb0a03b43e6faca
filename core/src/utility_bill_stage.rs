//! Utility bill resolution.
//!
//! Results carry bills as bundles: `|<utility>:<f1>:...:<f10>|...` per
//! utility, and `|<state>:<cost>|...` for state-average rates. Each FKT row
//! gets the bundle keyed by its assigned utility; if and only if that bundle
//! is absent, every cost field falls back to the state average and every
//! label reads `state_average_rate`.

use crate::{
    columns::{
        self as c, bill_field_col, state_average_bill_col, total_bill_col, BILL_FIELDS,
        STATE_AVERAGE_COLUMNS, STATE_AVERAGE_LABEL, UTILITY_BUNDLE_COLUMNS,
    },
    error::{PipelineError, PipelineResult},
    kernel,
    types::BuildingId,
};
use polars::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn bundle_pattern() -> PipelineResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([^|:]+):([^|]*)"))
        .as_ref()
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("bill bundle pattern: {e}")))
}

// ── Bundle parsing ──────────────────────────────────────────────────────────

/// Key → colon-separated fields, for every bundle in `raw`.
pub fn parse_bundles(raw: &str) -> PipelineResult<BTreeMap<String, Vec<String>>> {
    Ok(bundle_pattern()?
        .captures_iter(raw)
        .map(|cap| {
            let key = cap[1].trim().to_string();
            let fields = cap[2].split(':').map(|f| f.trim().to_string()).collect();
            (key, fields)
        })
        .collect())
}

/// State abbreviation → cost in whole USD.
pub fn parse_state_averages(raw: &str) -> PipelineResult<BTreeMap<String, f64>> {
    Ok(parse_bundles(raw)?
        .into_iter()
        .filter_map(|(state, fields)| {
            let cost: f64 = fields.first()?.parse().ok()?;
            Some((state, cost.round()))
        })
        .collect())
}

/// The ten bill fields for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBill {
    pub costs:     [Option<f64>; 5],
    pub labels:    [Option<String>; 4],
    pub num_bills: Option<i64>,
    pub from_state_average: bool,
}

impl ResolvedBill {
    fn from_fields(fields: &[String]) -> Self {
        let field = |i: usize| fields.get(i).filter(|f| !f.is_empty());
        let cost = |i: usize| field(i).and_then(|f| f.parse::<f64>().ok());
        let label = |i: usize| field(i).cloned();
        Self {
            costs:     [cost(0), cost(2), cost(4), cost(6), cost(8)],
            labels:    [label(1), label(3), label(5), label(7)],
            num_bills: field(9).and_then(|f| f.parse::<f64>().ok()).map(|n| n as i64),
            from_state_average: false,
        }
    }

    fn from_state_average(cost: f64) -> Self {
        let label = || Some(STATE_AVERAGE_LABEL.to_string());
        Self {
            costs:     [Some(cost); 5],
            labels:    [label(), label(), label(), label()],
            num_bills: None,
            from_state_average: true,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        self.costs[4]
    }
}

/// Resolve one row's bill from its bundle string, utility and state.
pub fn resolve_bill(
    building_id: BuildingId,
    column: &str,
    bundles: Option<&str>,
    utility: Option<&str>,
    state_average: Option<f64>,
    state: Option<&str>,
) -> PipelineResult<ResolvedBill> {
    if let (Some(raw), Some(utility)) = (bundles, utility) {
        if let Some(fields) = parse_bundles(raw)?.get(utility.trim()) {
            return Ok(ResolvedBill::from_fields(fields));
        }
    }
    match state_average {
        Some(cost) => Ok(ResolvedBill::from_state_average(cost)),
        None => Err(PipelineError::UtilityBundleMissing {
            building_id,
            column:  column.to_string(),
            utility: utility.unwrap_or_default().to_string(),
            state:   state.unwrap_or_default().to_string(),
        }),
    }
}

// ── Utility assignment ──────────────────────────────────────────────────────

/// Tract → assigned electric utility.
pub fn load_tract_utilities(path: &Path) -> PipelineResult<DataFrame> {
    kernel::read_csv(path)
}

/// Join each tract's assigned utility onto the frame.
pub fn attach_utility(lf: LazyFrame, tract_utilities: Option<&DataFrame>) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&lf)?;
    if present.iter().any(|n| n == c::UTILITY_ID) {
        return Ok(lf);
    }
    let Some(table) = tract_utilities else {
        log::debug!("No tract utility table; bills fall back to state averages");
        return Ok(lf.with_column(lit(NULL).cast(DataType::String).alias(c::UTILITY_ID)));
    };
    if !present.iter().any(|n| n == c::TRACT) {
        return Err(PipelineError::ColumnMissing {
            column:  c::TRACT.to_string(),
            context: "utility assignment".to_string(),
        });
    }
    let utilities = table
        .clone()
        .lazy()
        .select([
            col(c::TRACT).cast(DataType::String),
            col(c::UTILITY_ID).cast(DataType::String),
        ])
        .group_by([col(c::TRACT)])
        .agg([col(c::UTILITY_ID).first()]);
    Ok(lf
        .with_column(col(c::TRACT).cast(DataType::String))
        .join(utilities, [col(c::TRACT)], [col(c::TRACT)], JoinArgs::new(JoinType::Left)))
}

// ── Frame resolution ────────────────────────────────────────────────────────

/// Raw bundle columns present in `names`.
pub fn raw_bill_columns(names: &[String]) -> Vec<&'static str> {
    UTILITY_BUNDLE_COLUMNS
        .iter()
        .map(|(_, raw)| *raw)
        .chain(STATE_AVERAGE_COLUMNS.iter().map(|(_, raw)| *raw))
        .filter(|raw| names.iter().any(|n| n == *raw))
        .collect()
}

const ROW:     &str = "__bill_row";
const KEY:     &str = "__bill_key";
const SEGMENT: &str = "__bill_segment";

fn segment_col(raw_col: &str) -> String {
    format!("{SEGMENT}.{raw_col}")
}

/// Key of a `<key>:<fields>` segment, trimmed. Null when there is no colon.
fn segment_key(segment: Expr) -> Expr {
    segment
        .str()
        .extract(lit(r"^([^:]+):"), 1)
        .str()
        .extract(lit(r"^\s*(.*?)\s*$"), 1)
}

/// Field `index` after the key, trimmed, with blanks read as null.
fn segment_field(segment: Expr, index: usize) -> Expr {
    let pattern = format!(r"^[^:]*(?::[^:]*){{{index}}}:\s*([^:]*?)\s*(?::|$)");
    let field = segment.str().extract(lit(pattern), 1);
    when(field.clone().eq(lit("")))
        .then(lit(NULL).cast(DataType::String))
        .otherwise(field)
}

/// The last segment of `raw_col` whose key equals `key`, one row per match.
fn matching_segments(lf: &LazyFrame, raw_col: &str, key: Expr) -> LazyFrame {
    lf.clone()
        .select([
            col(ROW),
            key.alias(KEY),
            col(raw_col).cast(DataType::String).str().split(lit("|")).alias(SEGMENT),
        ])
        .explode([SEGMENT])
        .filter(segment_key(col(SEGMENT)).eq(col(KEY)))
        .group_by([col(ROW)])
        .agg([col(SEGMENT).last().alias(segment_col(raw_col).as_str())])
}

fn join_segments(lf: LazyFrame, raw_col: &str, key: Expr) -> LazyFrame {
    let segments = matching_segments(&lf, raw_col, key);
    lf.join(segments, [col(ROW)], [col(ROW)], JoinArgs::new(JoinType::Left))
}

/// Round half away from zero to whole dollars.
fn whole_dollars(cost: Expr) -> Expr {
    when(cost.clone().gt_eq(lit(0.0)))
        .then((cost.clone() + lit(0.5)).cast(DataType::Int64))
        .otherwise((cost - lit(0.5)).cast(DataType::Int64))
        .cast(DataType::Float64)
}

/// Replace the raw bundle columns of a materialized frame with resolved
/// per-field bill columns, state averages and the total mean bill.
pub fn resolve_bills(df: DataFrame) -> PipelineResult<DataFrame> {
    let names = kernel::frame_column_names(&df);
    let raw_cols = raw_bill_columns(&names);
    if raw_cols.is_empty() {
        log::debug!("No bill bundles present; bill resolution skipped");
        return Ok(df);
    }
    let kept: Vec<String> = names
        .iter()
        .filter(|n| !raw_cols.iter().any(|r| *r == n.as_str()))
        .cloned()
        .collect();

    let mut lf = df.lazy().with_row_index(ROW, None);
    for key in [c::UTILITY_ID, c::STATE] {
        if !names.iter().any(|n| n == key) {
            lf = lf.with_column(lit(NULL).cast(DataType::String).alias(key));
        }
    }

    let mut averages: BTreeMap<&str, String> = BTreeMap::new();
    for (fuel, raw_col) in STATE_AVERAGE_COLUMNS {
        if !raw_cols.contains(&raw_col) {
            continue;
        }
        let name = state_average_bill_col(fuel);
        let cost = segment_field(col(segment_col(raw_col).as_str()), 0).cast(DataType::Float64);
        lf = join_segments(lf, raw_col, col(c::STATE).cast(DataType::String))
            .with_column(whole_dollars(cost).alias(name.as_str()));
        averages.insert(fuel, name);
    }
    let average = |fuel: &str| match averages.get(fuel) {
        Some(name) => col(name.as_str()),
        None => lit(NULL).cast(DataType::Float64),
    };

    let utility_key = col(c::UTILITY_ID)
        .cast(DataType::String)
        .str()
        .extract(lit(r"^\s*(.*?)\s*$"), 1);
    let mut bundles = Vec::new();
    for (fuel, raw_col) in UTILITY_BUNDLE_COLUMNS {
        if raw_cols.contains(&raw_col) {
            lf = join_segments(lf, raw_col, utility_key.clone());
            bundles.push((fuel, raw_col));
        }
    }
    let resolved = lf.collect()?;

    for (fuel, raw_col) in &bundles {
        let segment = segment_col(raw_col);
        let uncovered = resolved
            .clone()
            .lazy()
            .filter(col(segment.as_str()).is_null().and(average(*fuel).is_null()))
            .select([
                col(c::BUILDING_ID).cast(DataType::Int64),
                col(c::UTILITY_ID).cast(DataType::String),
                col(c::STATE).cast(DataType::String),
            ])
            .limit(1)
            .collect()?;
        if uncovered.height() > 0 {
            let context = "utility bill resolution";
            let first = |name: &str| -> PipelineResult<Option<String>> {
                Ok(kernel::str_values(&uncovered, name, context)?.into_iter().next().flatten())
            };
            return Err(PipelineError::UtilityBundleMissing {
                building_id: kernel::i64_values(&uncovered, c::BUILDING_ID, context)?
                    .into_iter()
                    .next()
                    .flatten()
                    .unwrap_or_default(),
                column:      raw_col.to_string(),
                utility:     first(c::UTILITY_ID)?.unwrap_or_default(),
                state:       first(c::STATE)?.unwrap_or_default(),
            });
        }
        let fallbacks = resolved.column(segment.as_str())?.null_count();
        if fallbacks > 0 {
            log::debug!("{fallbacks} row(s) used the {fuel} state-average rate");
        }
    }

    let mut select: Vec<Expr> = kept.iter().map(|n| col(n.as_str())).collect();
    let mut electricity_mean = lit(0.0);
    for (fuel, raw_col) in &bundles {
        let segment = col(segment_col(raw_col).as_str());
        let matched = segment.clone().is_not_null();
        for (index, (field, is_cost)) in BILL_FIELDS.iter().enumerate() {
            let value = segment_field(segment.clone(), index);
            let name = bill_field_col(fuel, field, *is_cost);
            let expr = if *is_cost {
                when(matched.clone())
                    .then(value.cast(DataType::Float64))
                    .otherwise(average(*fuel))
            } else if *field == "num_bills" {
                when(matched.clone())
                    .then(value.cast(DataType::Float64).cast(DataType::Int64))
                    .otherwise(lit(NULL).cast(DataType::Int64))
            } else {
                when(matched.clone())
                    .then(value)
                    .otherwise(lit(STATE_AVERAGE_LABEL))
            };
            select.push(expr.alias(name.as_str()));
            if *fuel == "electricity" && *field == "mean" {
                electricity_mean = col(name.as_str());
            }
        }
    }

    let mut total = electricity_mean.fill_null(lit(0.0));
    for (fuel, name) in &averages {
        select.push(col(name.as_str()));
        if *fuel != "electricity" {
            total = total + col(name.as_str()).fill_null(lit(0.0));
        }
    }
    let lf = resolved
        .lazy()
        .sort([ROW], SortMultipleOptions::default())
        .select(select);
    Ok(lf.with_column(total.alias(total_bill_col().as_str())).collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundles_split_on_pipes_and_colons() {
        let parsed = parse_bundles("|1234:100:TOU:200|77:5:FLAT|").unwrap();
        assert_eq!(parsed["1234"], vec!["100", "TOU", "200"]);
        assert_eq!(parsed["77"], vec!["5", "FLAT"]);
    }

    #[test]
    fn state_average_rounds_to_whole_dollars() {
        let parsed = parse_state_averages("|CO:1520.6|WY:998.2|").unwrap();
        assert_eq!(parsed["CO"], 1521.0);
        assert_eq!(parsed["WY"], 998.0);
    }

    #[test]
    fn missing_everything_is_an_error() {
        let err = resolve_bill(9, "bundle", Some("|1:1:a:2:b:3:c:4:d:5:6|"), Some("2"), None, Some("CO"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UtilityBundleMissing { building_id: 9, .. }));
    }
}
