//! ResultsIngest: per-upgrade results, covariates, completion
//! classification, the failure gate and baseline backfill.
//!
//! RULES:
//!   - The baseline is ingested first; every other upgrade is
//!     backfilled against it.
//!   - Rows that did not succeed carry the baseline's values for every
//!     shared column outside the protected set, so their savings are zero.
//!   - Each upgrade is materialized once, to its hive-style cache.

use crate::{
    column_registry::ColumnRegistry,
    columns::{self as c, Fuel},
    derivation_stage::apply_rename_plan,
    error::{PipelineError, PipelineResult},
    kernel::{self, frame_column_names},
    types::{BuildingId, ColumnOrigin, UpgradeId, BASELINE_UPGRADE},
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Columns never copied from the baseline during backfill.
pub const PROTECTED_COLUMNS: [&str; 8] = [
    c::JOB_ID,
    c::STARTED_AT,
    c::COMPLETED_AT,
    c::COMPLETION_STATUS,
    c::APPLICABILITY,
    c::UPGRADE_NAME,
    c::UPGRADE_ID,
    c::REFERENCE_SCENARIO,
];

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_INVALID: &str = "Invalid";
pub const STATUS_FAIL:    &str = "Fail";

pub const VERIFIED_SUCCESS:         &str = "Success";
pub const VERIFIED_NOT_APPLICABLE:  &str = "Not Applicable";
pub const VERIFIED_FAIL_DRIVER:     &str = "Fail: per-batch-driver";
pub const VERIFIED_FAIL_MISSING:    &str = "Fail: missing results";
pub const VERIFIED_FAIL_NO_STATUS:  &str = "Fail: missing status";
pub const VERIFIED_FAIL_UNRECOGNIZED: &str = "Fail: unrecognized status";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub dataset:                        String,
    pub acceptable_failure_fraction:    f64,
    pub drop_failed_baseline_buildings: bool,
}

/// Per-upgrade completion summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub upgrade_id:                      UpgradeId,
    pub upgrade_name:                    String,
    pub total:                           usize,
    pub success:                         usize,
    pub not_applicable:                  usize,
    pub fail:                            usize,
    pub fraction_fail:                   f64,
    pub fraction_not_applicable:         f64,
    pub fraction_applicable:             f64,
    pub success_in_base_fail_in_upgrade: usize,
    pub success_in_upgrade_fail_in_base: usize,
    pub failure_modes:                   BTreeMap<String, usize>,
}

pub struct IngestOutput {
    pub frame:                LazyFrame,
    pub summaries:            Vec<FailureSummary>,
    pub dropped_building_ids: Vec<BuildingId>,
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// `<dir>/results_up<NN>.parquet`
pub fn results_path(results_dir: &Path, upgrade_id: UpgradeId) -> PathBuf {
    results_dir.join(format!("results_up{upgrade_id:02}.parquet"))
}

/// Scan every requested upgrade's raw results. The baseline is always included.
pub fn load_results(
    results_dir: &Path,
    upgrade_ids: &[UpgradeId],
) -> PipelineResult<BTreeMap<UpgradeId, LazyFrame>> {
    let mut ids: BTreeSet<UpgradeId> = upgrade_ids.iter().copied().collect();
    ids.insert(BASELINE_UPGRADE);
    let mut results = BTreeMap::new();
    for id in ids {
        results.insert(id, kernel::scan_parquet(&results_path(results_dir, id))?);
    }
    Ok(results)
}

/// Read the sample-covariate table, key it on `building_id` and apply the
/// registry's renames for sample covariates.
pub fn load_covariates(path: &Path, registry: &ColumnRegistry) -> PipelineResult<LazyFrame> {
    let df = kernel::read_csv(path)?;
    covariates_from_frame(df, registry)
}

pub fn covariates_from_frame(df: DataFrame, registry: &ColumnRegistry) -> PipelineResult<LazyFrame> {
    let names = frame_column_names(&df);
    let key = c::COVARIATE_ID_KEYS
        .iter()
        .find(|k| names.iter().any(|n| n == *k))
        .ok_or_else(|| PipelineError::ColumnMissing {
            column:  c::COVARIATE_ID_KEYS.join(" | "),
            context: "sample covariates".to_string(),
        })?;
    let exprs: Vec<Expr> = names
        .iter()
        .map(|n| {
            if n == key {
                col(n.as_str()).cast(DataType::Int64).alias(c::BUILDING_ID)
            } else {
                col(n.as_str())
            }
        })
        .collect();
    let lf = df.lazy().select(exprs);
    apply_rename_plan(lf, &registry.rename_plan_for(ColumnOrigin::SampleCovariate)?)
}

// ── Per-row classification ──────────────────────────────────────────────────

fn verified_status_expr(present: &[String]) -> PipelineResult<Expr> {
    let site_total = c::site_total_col();
    if !present.iter().any(|n| *n == site_total) {
        return Err(PipelineError::ColumnMissing {
            column:  site_total,
            context: "completion classification".to_string(),
        });
    }
    let mut missing_results = col(site_total.as_str()).is_null();
    let elec_total = c::fuel_total_col(Fuel::Electricity);
    if present.iter().any(|n| *n == elec_total) {
        missing_results = missing_results.or(col(elec_total.as_str()).is_null());
    }
    let status = || col(c::COMPLETION_STATUS).cast(DataType::String);
    Ok(when(status().is_null())
        .then(lit(VERIFIED_FAIL_NO_STATUS))
        .when(status().eq(lit(STATUS_FAIL)))
        .then(lit(VERIFIED_FAIL_DRIVER))
        .when(status().eq(lit(STATUS_INVALID)))
        .then(lit(VERIFIED_NOT_APPLICABLE))
        .when(status().eq(lit(STATUS_SUCCESS)).and(missing_results))
        .then(lit(VERIFIED_FAIL_MISSING))
        .when(status().eq(lit(STATUS_SUCCESS)))
        .then(lit(VERIFIED_SUCCESS))
        .otherwise(lit(VERIFIED_FAIL_UNRECOGNIZED))
        .alias(c::VERIFIED_STATUS))
}

fn reassigned_status_expr() -> Expr {
    let verified = || col(c::VERIFIED_STATUS);
    when(verified().eq(lit(VERIFIED_SUCCESS)))
        .then(lit(STATUS_SUCCESS))
        .when(verified().eq(lit(VERIFIED_NOT_APPLICABLE)))
        .then(lit(STATUS_INVALID))
        .otherwise(lit(STATUS_FAIL))
        .alias(c::COMPLETION_STATUS)
}

/// Classify verified completion status and re-assign completion_status.
pub fn classify_completion(lf: LazyFrame) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&lf)?;
    let verified = verified_status_expr(&present)?;
    Ok(lf.with_column(verified).with_column(reassigned_status_expr()))
}

fn string_boolean(expr: Expr) -> Expr {
    when(is_one_of_ci(expr.clone(), "true"))
        .then(lit(true))
        .when(is_one_of_ci(expr, "false"))
        .then(lit(false))
        .otherwise(lit(NULL).cast(DataType::Boolean))
}

fn is_one_of_ci(expr: Expr, word: &str) -> Expr {
    let mut title = word.to_string();
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    kernel::is_one_of(expr, &[word, &title, &word.to_ascii_uppercase()])
}

fn is_string_boolean(series: &Series) -> PipelineResult<bool> {
    let mut seen_any = false;
    for value in series.str()?.into_iter().flatten() {
        seen_any = true;
        if !matches!(value.to_ascii_lowercase().as_str(), "true" | "false") {
            return Ok(false);
        }
    }
    Ok(seen_any)
}

/// Coerce per-measure applicability columns (null → false) and string
/// columns whose values are all true/false/null to booleans.
pub fn coerce_booleans(df: DataFrame) -> PipelineResult<DataFrame> {
    let mut exprs = Vec::new();
    for column in df.get_columns() {
        let name = column.name().to_string();
        let series = column.as_materialized_series();
        let is_measure_applicability =
            name == c::APPLICABILITY || name.starts_with("applicability.");
        let stringly = series.dtype() == &DataType::String && is_string_boolean(series)?;
        let coerced = if stringly {
            Some(string_boolean(col(name.as_str())))
        } else if is_measure_applicability && series.dtype() != &DataType::Boolean {
            Some(col(name.as_str()).cast(DataType::Boolean))
        } else if is_measure_applicability {
            Some(col(name.as_str()))
        } else {
            None
        };
        if let Some(expr) = coerced {
            let expr = if is_measure_applicability {
                expr.fill_null(lit(false))
            } else {
                expr
            };
            exprs.push(expr.alias(name.as_str()));
        }
    }
    if exprs.is_empty() {
        return Ok(df);
    }
    Ok(df.lazy().with_columns(exprs).collect()?)
}

// ── Summaries ───────────────────────────────────────────────────────────────

fn status_by_building(df: &DataFrame) -> PipelineResult<HashMap<BuildingId, String>> {
    let ids = kernel::i64_values(df, c::BUILDING_ID, "failure summary")?;
    let statuses = kernel::str_values(df, c::COMPLETION_STATUS, "failure summary")?;
    Ok(ids
        .into_iter()
        .zip(statuses)
        .filter_map(|(id, s)| Some((id?, s.unwrap_or_default())))
        .collect())
}

/// Summarize one classified upgrade frame against the baseline statuses.
pub fn summarize_failures(
    df: &DataFrame,
    upgrade_id: UpgradeId,
    baseline_status: &HashMap<BuildingId, String>,
) -> PipelineResult<FailureSummary> {
    let verified = kernel::str_values(df, c::VERIFIED_STATUS, "failure summary")?;
    let names = kernel::str_values(df, c::UPGRADE_NAME, "failure summary")?;
    let statuses = status_by_building(df)?;

    let total = verified.len();
    let mut success = 0;
    let mut not_applicable = 0;
    let mut failure_modes: BTreeMap<String, usize> = BTreeMap::new();
    for v in verified.iter().flatten() {
        match v.as_str() {
            VERIFIED_SUCCESS => success += 1,
            VERIFIED_NOT_APPLICABLE => not_applicable += 1,
            mode => *failure_modes.entry(mode.to_string()).or_insert(0) += 1,
        }
    }
    let fail: usize = failure_modes.values().sum();

    let mut base_ok_upgrade_fail = 0;
    let mut upgrade_ok_base_fail = 0;
    for (id, status) in &statuses {
        let base = baseline_status.get(id).map(String::as_str);
        match (base, status.as_str()) {
            (Some(STATUS_SUCCESS), STATUS_FAIL) => base_ok_upgrade_fail += 1,
            (Some(STATUS_FAIL), STATUS_SUCCESS) => upgrade_ok_base_fail += 1,
            _ => {}
        }
    }

    let fraction = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
    let upgrade_name = names
        .iter()
        .zip(verified.iter())
        .find(|(_, v)| v.as_deref() == Some(VERIFIED_SUCCESS))
        .and_then(|(n, _)| n.clone())
        .or_else(|| names.iter().flatten().next().cloned())
        .unwrap_or_else(|| format!("upgrade {upgrade_id}"));

    Ok(FailureSummary {
        upgrade_id,
        upgrade_name,
        total,
        success,
        not_applicable,
        fail,
        fraction_fail: fraction(fail),
        fraction_not_applicable: fraction(not_applicable),
        fraction_applicable: fraction(total - not_applicable),
        success_in_base_fail_in_upgrade: base_ok_upgrade_fail,
        success_in_upgrade_fail_in_base: upgrade_ok_base_fail,
        failure_modes,
    })
}

fn enforce_failure_gate(summary: &FailureSummary, threshold: f64) -> PipelineResult<()> {
    if summary.fraction_fail > threshold {
        return Err(PipelineError::UpgradeFailureRateExceeded {
            upgrade_id:   summary.upgrade_id,
            upgrade_name: summary.upgrade_name.clone(),
            fraction:     summary.fraction_fail,
            threshold,
        });
    }
    Ok(())
}

// ── Backfill ────────────────────────────────────────────────────────────────

fn check_slice_dtypes(
    reference: &SchemaRef,
    slice: &LazyFrame,
    upgrade_id: UpgradeId,
    label: &str,
) -> PipelineResult<()> {
    let schema = kernel::schema_of(slice)?;
    for (name, dtype) in schema.iter() {
        let Some(expected) = reference.get(name.as_str()) else {
            continue;
        };
        if expected != dtype && *dtype != DataType::Null && *expected != DataType::Null {
            return Err(PipelineError::SchemaConflict {
                column:     name.to_string(),
                upgrade_id,
                left:       format!("{expected} (success rows)"),
                right:      format!("{dtype} ({label} rows)"),
            });
        }
    }
    Ok(())
}

/// Replace the outputs of Invalid and Fail rows with the baseline's values.
pub fn backfill_from_baseline(
    upgrade: DataFrame,
    baseline: &DataFrame,
    upgrade_id: UpgradeId,
) -> PipelineResult<DataFrame> {
    let upgrade_cols = frame_column_names(&upgrade);
    let baseline_cols: BTreeSet<String> = frame_column_names(baseline).into_iter().collect();
    let shared: BTreeSet<&str> = upgrade_cols
        .iter()
        .map(String::as_str)
        .filter(|n| {
            baseline_cols.contains(*n)
                && *n != c::BUILDING_ID
                && *n != c::VERIFIED_STATUS
                && !PROTECTED_COLUMNS.contains(n)
        })
        .collect();

    let statuses = kernel::str_values(&upgrade, c::COMPLETION_STATUS, "backfill")?;
    let names = kernel::str_values(&upgrade, c::UPGRADE_NAME, "backfill")?;
    let success_name = statuses
        .iter()
        .zip(names.iter())
        .find(|(s, _)| s.as_deref() == Some(STATUS_SUCCESS))
        .and_then(|(_, n)| n.clone());

    let lf = upgrade.lazy();
    let success = lf.clone().filter(col(c::COMPLETION_STATUS).eq(lit(STATUS_SUCCESS)));
    let reference = kernel::schema_of(&success)?;

    let mut base_select = vec![col(c::BUILDING_ID)];
    base_select.extend(shared.iter().map(|n| col(*n)));
    let base = baseline.clone().lazy().select(base_select);
    let kept: Vec<Expr> = upgrade_cols
        .iter()
        .filter(|n| !shared.contains(n.as_str()))
        .map(|n| col(n.as_str()))
        .collect();
    let ordered: Vec<Expr> = upgrade_cols.iter().map(|n| col(n.as_str())).collect();

    let mut slices = vec![success];
    for status in [STATUS_INVALID, STATUS_FAIL] {
        let mut slice = lf
            .clone()
            .filter(col(c::COMPLETION_STATUS).eq(lit(status)))
            .select(kept.clone())
            .join(
                base.clone(),
                [col(c::BUILDING_ID)],
                [col(c::BUILDING_ID)],
                JoinArgs::new(JoinType::Left),
            )
            .with_column(lit(false).alias(c::APPLICABILITY));
        if let Some(name) = &success_name {
            slice = slice.with_column(lit(name.clone()).alias(c::UPGRADE_NAME));
        }
        let slice = slice.select(ordered.clone());
        check_slice_dtypes(&reference, &slice, upgrade_id, status)?;
        slices.push(slice);
    }

    let merged = concat(slices, UnionArgs::default())?
        .sort_by_exprs([col(c::BUILDING_ID)], SortMultipleOptions::default());
    Ok(merged.collect()?)
}

// ── Orchestration ───────────────────────────────────────────────────────────

fn prepare_upgrade(
    raw: LazyFrame,
    covariates: &LazyFrame,
    upgrade_id: UpgradeId,
    dataset: &str,
) -> PipelineResult<DataFrame> {
    let result_cols: BTreeSet<String> = kernel::column_names(&raw)?.into_iter().collect();
    let mut lf = raw
        .with_column(col(c::BUILDING_ID).cast(DataType::Int64))
        .with_column(lit(upgrade_id).alias(c::UPGRADE_ID))
        .with_column(lit(dataset).alias(c::DATASET));
    if upgrade_id == BASELINE_UPGRADE {
        lf = lf.with_columns([
            lit(true).alias(c::APPLICABILITY),
            lit(c::BASELINE_NAME).alias(c::UPGRADE_NAME),
        ]);
    } else if !result_cols.contains(c::UPGRADE_NAME) {
        lf = lf.with_column(lit(format!("upgrade {upgrade_id}")).alias(c::UPGRADE_NAME));
    }

    let cov_cols: Vec<Expr> = kernel::column_names(covariates)?
        .into_iter()
        .filter(|n| n == c::BUILDING_ID || !result_cols.contains(n))
        .map(|n| col(n.as_str()))
        .collect();
    let lf = lf.join(
        covariates.clone().select(cov_cols),
        [col(c::BUILDING_ID)],
        [col(c::BUILDING_ID)],
        JoinArgs::new(JoinType::Left),
    );

    let df = coerce_booleans(lf.collect()?)?;
    let mut lf = classify_completion(df.lazy())?;
    if upgrade_id != BASELINE_UPGRADE && !result_cols.contains(c::APPLICABILITY) {
        lf = lf.with_column(col(c::COMPLETION_STATUS).eq(lit(STATUS_SUCCESS)).alias(c::APPLICABILITY));
    }
    kernel::materialize(lf, &format!("ingest upgrade {upgrade_id}"))
}

fn drop_buildings(df: DataFrame, drop: &BTreeSet<BuildingId>) -> PipelineResult<DataFrame> {
    if drop.is_empty() {
        return Ok(df);
    }
    let ids = kernel::i64_values(&df, c::BUILDING_ID, "baseline failure drop")?;
    let mask: BooleanChunked = ids
        .iter()
        .map(|id| Some(!id.is_some_and(|i| drop.contains(&i))))
        .collect();
    Ok(df.filter(&mask)?)
}

/// Reuse a complete per-upgrade cache when every upgrade has one.
pub fn reload_cached(output_dir: &Path, upgrade_ids: &[UpgradeId]) -> PipelineResult<Option<LazyFrame>> {
    let mut ids: BTreeSet<UpgradeId> = upgrade_ids.iter().copied().collect();
    ids.insert(BASELINE_UPGRADE);
    if !ids.iter().all(|id| kernel::upgrade_cache_path(output_dir, *id).exists()) {
        return Ok(None);
    }
    let mut frames = Vec::with_capacity(ids.len());
    for id in ids {
        frames.push((id, kernel::scan_parquet(&kernel::upgrade_cache_path(output_dir, id))?));
    }
    log::info!("Ingest reloaded {} upgrade(s) from cache", frames.len());
    Ok(Some(kernel::harmonize_and_concat(frames)?))
}

/// Buildings whose baseline run failed. Computed from the raw baseline
/// results so they can leave the sample before any weight is drawn for them.
pub fn failed_baseline_buildings(
    results_dir: &Path,
    covariates: &LazyFrame,
    dataset: &str,
) -> PipelineResult<BTreeSet<BuildingId>> {
    let raw = kernel::scan_parquet(&results_path(results_dir, BASELINE_UPGRADE))?;
    let baseline = prepare_upgrade(raw, covariates, BASELINE_UPGRADE, dataset)?;
    Ok(status_by_building(&baseline)?
        .into_iter()
        .filter(|(_, s)| s.as_str() == STATUS_FAIL)
        .map(|(id, _)| id)
        .collect())
}

/// Run ResultsIngest over every upgrade and cache each one.
pub fn ingest_results(
    raw: BTreeMap<UpgradeId, LazyFrame>,
    covariates: &LazyFrame,
    settings: &IngestSettings,
    output_dir: &Path,
) -> PipelineResult<IngestOutput> {
    let mut raw = raw;
    let baseline_raw = raw.remove(&BASELINE_UPGRADE).ok_or_else(|| {
        PipelineError::missing_input(format!("results for upgrade {BASELINE_UPGRADE}"))
    })?;

    let baseline = prepare_upgrade(baseline_raw, covariates, BASELINE_UPGRADE, &settings.dataset)?;
    let baseline_status = status_by_building(&baseline)?;
    let baseline_summary = summarize_failures(&baseline, BASELINE_UPGRADE, &baseline_status)?;
    enforce_failure_gate(&baseline_summary, settings.acceptable_failure_fraction)?;

    let dropped: BTreeSet<BuildingId> = if settings.drop_failed_baseline_buildings {
        baseline_status
            .iter()
            .filter(|(_, s)| s.as_str() == STATUS_FAIL)
            .map(|(id, _)| *id)
            .collect()
    } else {
        BTreeSet::new()
    };
    if !dropped.is_empty() {
        log::warn!(
            "Dropping {} building(s) that failed in the baseline from all upgrades",
            dropped.len()
        );
    }
    let mut baseline = drop_buildings(baseline, &dropped)?;
    kernel::write_parquet(&mut baseline, &kernel::upgrade_cache_path(output_dir, BASELINE_UPGRADE))?;

    let mut summaries = vec![baseline_summary];
    let mut frames = vec![(
        BASELINE_UPGRADE,
        kernel::scan_parquet(&kernel::upgrade_cache_path(output_dir, BASELINE_UPGRADE))?,
    )];

    for (upgrade_id, raw_upgrade) in raw {
        let prepared = prepare_upgrade(raw_upgrade, covariates, upgrade_id, &settings.dataset)?;
        let summary = summarize_failures(&prepared, upgrade_id, &baseline_status)?;
        log::info!(
            "Upgrade {upgrade_id} ({}): {} rows, {} success, {} n/a, {} fail",
            summary.upgrade_name,
            summary.total,
            summary.success,
            summary.not_applicable,
            summary.fail
        );
        enforce_failure_gate(&summary, settings.acceptable_failure_fraction)?;
        summaries.push(summary);

        let prepared = drop_buildings(prepared, &dropped)?;
        let mut backfilled = backfill_from_baseline(prepared, &baseline, upgrade_id)?;
        let path = kernel::upgrade_cache_path(output_dir, upgrade_id);
        kernel::write_parquet(&mut backfilled, &path)?;
        frames.push((upgrade_id, kernel::scan_parquet(&path)?));
    }

    Ok(IngestOutput {
        frame: kernel::harmonize_and_concat(frames)?,
        summaries,
        dropped_building_ids: dropped.into_iter().collect(),
    })
}
