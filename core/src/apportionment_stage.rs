//! Apportionment: match simulated buildings to a bootstrapped tract-level
//! truth inventory and produce the foreign-key table (FKT).
//!
//! ALGORITHM:
//!   1. Bucket both tables on (sampling region, building type, size bin,
//!      HVAC system + heating fuel). Every distinct bucket gets a group id.
//!   2. Truth buckets with no simulated building are reported and dropped.
//!   3. Optionally drop micro-schools from buckets with enough larger schools.
//!   4. Per bucket, draw one simulated building per truth row, with
//!      replacement, from the StageSlot::Apportionment stream.
//!   5. weight = truth_sqft / (sim_sqft * bootstrap_coefficient).
//!   6. Attach state abbreviations and ASHRAE climate zones.
//!
//! RULE: the FKT is persisted under a seed-specific path. Reruns reload it
//! instead of redrawing.

use crate::{
    columns as c,
    error::{PipelineError, PipelineResult},
    kernel,
    lookups::{
        ashrae_climate_zone, normalize_state_fips, state_abbreviation, MICRO_SCHOOL_MAX_SQFT,
        MICRO_SCHOOL_MIN_LARGER, SCHOOL_TYPES,
    },
    rng::StageRng,
    types::BuildingId,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const TRUTH_SQFT:            &str = "truth_sqft";
pub const BOOTSTRAP_COEFFICIENT: &str = "bootstrap_coefficient";
pub const BUCKET:                &str = "apportionment_bucket";
pub const GROUP_ID:              &str = "apportionment_group_id";

/// Columns both tables must carry to be bucketed.
pub const STRATIFIERS: [&str; 5] = [
    c::SAMPLING_REGION,
    c::BLDG_TYPE,
    c::SIZE_BIN,
    c::HVAC_SYSTEM,
    c::HEATING_FUEL,
];

/// Truth-row geography carried onto every draw, when present.
pub const FKT_GEOGRAPHY: [&str; 5] = [
    c::TRACT,
    c::COUNTY,
    c::PUMA,
    c::STATE_ID,
    c::CLIMATE_ZONE_RAW,
];

#[derive(Debug, Clone)]
pub struct ApportionmentSettings {
    pub seed:               u64,
    pub drop_micro_schools: bool,
    pub reload_from_cache:  bool,
    /// Fingerprint of everything the draws depend on besides the seed.
    pub input_digest:       String,
}

/// A truth bucket no simulated building can fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketShortfall {
    pub bucket:     String,
    pub truth_rows: usize,
    pub truth_sqft: f64,
}

pub struct ApportionmentOutput {
    pub fkt:                   LazyFrame,
    pub shortfalls:            Vec<BucketShortfall>,
    pub micro_schools_dropped: usize,
    pub reloaded:              bool,
    pub cache_path:            PathBuf,
}

// ── Bucketing ───────────────────────────────────────────────────────────────

/// `<region>|<type>|<size bin>|<hvac>_<fuel>`
pub fn bucket_expr() -> Expr {
    let text = |name: &str| col(name).cast(DataType::String).fill_null(lit(""));
    concat_str(
        [
            text(c::SAMPLING_REGION),
            text(c::BLDG_TYPE),
            text(c::SIZE_BIN),
            concat_str([text(c::HVAC_SYSTEM), text(c::HEATING_FUEL)], "_", true),
        ],
        "|",
        true,
    )
    .alias(BUCKET)
}

fn require_stratifiers(present: &[String], context: &str) -> PipelineResult<()> {
    for name in STRATIFIERS.iter().chain([&c::FLR_AREA]) {
        if !present.iter().any(|n| n == *name) {
            return Err(PipelineError::ColumnMissing {
                column:  name.to_string(),
                context: context.to_string(),
            });
        }
    }
    Ok(())
}

/// Simulated building ids per bucket, sorted, with each building's floor area.
struct SimulatedPool {
    by_bucket: BTreeMap<String, Vec<BuildingId>>,
    sqft:      BTreeMap<BuildingId, f64>,
}

fn simulated_pool(simulated: LazyFrame) -> PipelineResult<SimulatedPool> {
    let present = kernel::column_names(&simulated)?;
    require_stratifiers(&present, "apportionment (simulated buildings)")?;
    let df = kernel::materialize(
        simulated.select([col(c::BUILDING_ID), bucket_expr(), col(c::FLR_AREA)]),
        "apportionment simulated pool",
    )?;
    let ids = kernel::i64_values(&df, c::BUILDING_ID, "apportionment pool")?;
    let buckets = kernel::str_values(&df, BUCKET, "apportionment pool")?;
    let areas = kernel::f64_values(&df, c::FLR_AREA, "apportionment pool")?;

    let mut by_bucket: BTreeMap<String, Vec<BuildingId>> = BTreeMap::new();
    let mut sqft = BTreeMap::new();
    for ((id, bucket), area) in ids.into_iter().zip(buckets).zip(areas) {
        let (Some(id), Some(bucket)) = (id, bucket) else { continue };
        by_bucket.entry(bucket).or_default().push(id);
        sqft.insert(id, area.unwrap_or(0.0));
    }
    for ids in by_bucket.values_mut() {
        ids.sort_unstable();
        ids.dedup();
    }
    Ok(SimulatedPool { by_bucket, sqft })
}

// ── Truth reduction ─────────────────────────────────────────────────────────

struct TruthRows {
    frame:   DataFrame,
    buckets: Vec<String>,
    sqft:    Vec<f64>,
    coef:    Vec<f64>,
    types:   Vec<String>,
}

fn truth_rows(truth: LazyFrame) -> PipelineResult<TruthRows> {
    let present = kernel::column_names(&truth)?;
    require_stratifiers(&present, "apportionment (truth inventory)")?;
    if !present.iter().any(|n| n == BOOTSTRAP_COEFFICIENT) {
        return Err(PipelineError::ColumnMissing {
            column:  BOOTSTRAP_COEFFICIENT.to_string(),
            context: "apportionment (truth inventory)".to_string(),
        });
    }

    let mut select = vec![bucket_expr()];
    select.extend(STRATIFIERS.iter().map(|s| col(*s)));
    select.extend(
        FKT_GEOGRAPHY
            .iter()
            .filter(|g| present.iter().any(|n| n == **g))
            .map(|g| col(*g).cast(DataType::String)),
    );
    select.push(col(c::FLR_AREA).cast(DataType::Float64).alias(TRUTH_SQFT));
    select.push(col(BOOTSTRAP_COEFFICIENT).cast(DataType::Float64));

    let frame = kernel::materialize(truth.select(select), "apportionment truth inventory")?;
    let context = "apportionment truth inventory";
    Ok(TruthRows {
        buckets: kernel::str_values(&frame, BUCKET, context)?
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect(),
        sqft: kernel::f64_values(&frame, TRUTH_SQFT, context)?
            .into_iter()
            .map(|v| v.unwrap_or(0.0))
            .collect(),
        coef: kernel::f64_values(&frame, BOOTSTRAP_COEFFICIENT, context)?
            .into_iter()
            .map(|v| v.unwrap_or(1.0))
            .collect(),
        types: kernel::str_values(&frame, c::BLDG_TYPE, context)?
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect(),
        frame,
    })
}

/// Row indices per truth bucket.
fn rows_by_bucket(truth: &TruthRows) -> BTreeMap<String, Vec<usize>> {
    let mut rows: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, bucket) in truth.buckets.iter().enumerate() {
        rows.entry(bucket.clone()).or_default().push(idx);
    }
    rows
}

/// Drop truth buckets the simulation cannot fill and report them.
pub fn shortfalls(
    truth_buckets: &mut BTreeMap<String, Vec<usize>>,
    truth_sqft: &[f64],
    simulated: &BTreeMap<String, Vec<BuildingId>>,
) -> Vec<BucketShortfall> {
    let empty: Vec<String> = truth_buckets
        .keys()
        .filter(|b| simulated.get(*b).map_or(true, Vec::is_empty))
        .cloned()
        .collect();
    let mut report = Vec::with_capacity(empty.len());
    for bucket in empty {
        let rows = truth_buckets.remove(&bucket).unwrap_or_default();
        let sqft: f64 = rows.iter().map(|r| truth_sqft[*r]).sum();
        log::warn!(
            "Apportionment shortfall: bucket '{bucket}' has {} truth row(s) ({sqft:.0} ft2) and no simulated buildings",
            rows.len()
        );
        report.push(BucketShortfall {
            bucket,
            truth_rows: rows.len(),
            truth_sqft: sqft,
        });
    }
    report
}

/// Remove schools under the micro-school floor area from buckets that keep
/// at least MICRO_SCHOOL_MIN_LARGER larger schools. Returns rows dropped.
pub fn drop_micro_schools(
    truth_buckets: &mut BTreeMap<String, Vec<usize>>,
    truth_sqft: &[f64],
    truth_types: &[String],
) -> usize {
    let is_school = |row: usize| SCHOOL_TYPES.contains(&truth_types[row].as_str());
    let mut dropped = 0;
    for rows in truth_buckets.values_mut() {
        let larger = rows
            .iter()
            .filter(|r| is_school(**r) && truth_sqft[**r] >= MICRO_SCHOOL_MAX_SQFT)
            .count();
        if larger < MICRO_SCHOOL_MIN_LARGER {
            continue;
        }
        let before = rows.len();
        rows.retain(|r| !(is_school(*r) && truth_sqft[*r] < MICRO_SCHOOL_MAX_SQFT));
        dropped += before - rows.len();
    }
    if dropped > 0 {
        log::info!("Dropped {dropped} micro-school truth row(s)");
    }
    dropped
}

// ── State and climate zone ──────────────────────────────────────────────────

/// Normalise state ids and attach state abbreviations and ASHRAE zones.
pub fn attach_state_and_climate(mut df: DataFrame) -> PipelineResult<DataFrame> {
    let names = kernel::frame_column_names(&df);
    if names.iter().any(|n| n == c::STATE_ID) {
        let ids: Vec<Option<String>> = kernel::str_values(&df, c::STATE_ID, "state lookup")?
            .into_iter()
            .map(|v| v.map(|s| normalize_state_fips(&s)))
            .collect();
        let abbrs: Vec<Option<&str>> = ids
            .iter()
            .map(|v| v.as_deref().and_then(state_abbreviation))
            .collect();
        let unknown = ids.iter().zip(&abbrs).filter(|(i, a)| i.is_some() && a.is_none()).count();
        if unknown > 0 {
            log::warn!("{unknown} row(s) carry a state id with no known abbreviation");
        }
        df.with_column(Series::new(c::STATE_ID.into(), ids))?;
        df.with_column(Series::new(c::STATE.into(), abbrs))?;
    }
    if names.iter().any(|n| n == c::CLIMATE_ZONE_RAW) {
        let zones: Vec<Option<String>> = kernel::str_values(&df, c::CLIMATE_ZONE_RAW, "climate zone lookup")?
            .into_iter()
            .map(|v| v.and_then(|z| ashrae_climate_zone(&z)))
            .collect();
        df.with_column(Series::new(c::ASHRAE_CZ.into(), zones))?;
    }
    Ok(df)
}

// ── FKT construction ────────────────────────────────────────────────────────

/// Build the FKT from simulated buildings and the truth inventory. Does not
/// touch the cache.
pub fn build_fkt(
    simulated: LazyFrame,
    truth: LazyFrame,
    drop_micro: bool,
    rng: &mut StageRng,
) -> PipelineResult<(DataFrame, Vec<BucketShortfall>, usize)> {
    let pool = simulated_pool(simulated)?;
    let truth = truth_rows(truth)?;
    let mut buckets = rows_by_bucket(&truth);

    let all_buckets: BTreeSet<&String> = pool.by_bucket.keys().chain(buckets.keys()).collect();
    let group_ids: BTreeMap<String, i64> = all_buckets
        .into_iter()
        .enumerate()
        .map(|(idx, b)| (b.clone(), idx as i64))
        .collect();

    let report = shortfalls(&mut buckets, &truth.sqft, &pool.by_bucket);
    let micro_dropped = if drop_micro {
        drop_micro_schools(&mut buckets, &truth.sqft, &truth.types)
    } else {
        0
    };

    let mut rows: Vec<IdxSize> = Vec::new();
    let mut building_ids: Vec<BuildingId> = Vec::new();
    let mut groups: Vec<i64> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();
    let mut degenerate = 0usize;
    for (bucket, truth_idx) in &buckets {
        let Some(candidates) = pool.by_bucket.get(bucket) else { continue };
        let draws = rng.draw_with_replacement(candidates, truth_idx.len());
        let group = group_ids.get(bucket).copied().unwrap_or(-1);
        for (row, id) in truth_idx.iter().zip(draws) {
            let sim_sqft = pool.sqft.get(&id).copied().unwrap_or(0.0);
            let denom = sim_sqft * truth.coef[*row];
            let weight = if denom > 0.0 {
                truth.sqft[*row] / denom
            } else {
                degenerate += 1;
                0.0
            };
            rows.push(*row as IdxSize);
            building_ids.push(id);
            groups.push(group);
            weights.push(weight);
        }
    }
    if degenerate > 0 {
        log::warn!("{degenerate} FKT row(s) drew a building with no floor area; weight set to 0");
    }

    let idx = IdxCa::from_vec("row".into(), rows);
    let mut fkt = truth.frame.take(&idx)?;
    fkt.with_column(Series::new(c::BUILDING_ID.into(), building_ids))?;
    fkt.with_column(Series::new(GROUP_ID.into(), groups))?;
    fkt.with_column(Series::new(c::WEIGHT.into(), weights))?;
    let fkt = attach_state_and_climate(fkt)?;

    log::info!(
        "FKT built: {} row(s) over {} bucket(s), {} shortfall bucket(s)",
        fkt.height(),
        buckets.len(),
        report.len()
    );
    Ok((fkt, report, micro_dropped))
}

/// Run the apportioner, reusing the persisted FKT for this seed and input
/// digest when allowed.
pub fn apportion(
    simulated: LazyFrame,
    truth: LazyFrame,
    settings: &ApportionmentSettings,
    output_dir: &Path,
    rng: &mut StageRng,
) -> PipelineResult<ApportionmentOutput> {
    let cache_path = kernel::fkt_cache_path(output_dir, settings.seed, &settings.input_digest);
    if settings.reload_from_cache && cache_path.exists() {
        log::info!("FKT reloaded from {}", cache_path.display());
        return Ok(ApportionmentOutput {
            fkt:                   kernel::scan_parquet(&cache_path)?,
            shortfalls:            Vec::new(),
            micro_schools_dropped: 0,
            reloaded:              true,
            cache_path,
        });
    }

    let (fkt, shortfalls, micro_schools_dropped) =
        build_fkt(simulated, truth, settings.drop_micro_schools, rng)?;
    Ok(ApportionmentOutput {
        fkt: kernel::checkpoint_parquet(fkt.lazy(), &cache_path, "apportioned FKT")?,
        shortfalls,
        micro_schools_dropped,
        reloaded: false,
        cache_path,
    })
}

/// An FKT straight from the sample: one row per simulated building, with
/// the covariate weight (or 1.0) and the covariates' own geography.
pub fn fkt_from_sample(covariates: LazyFrame) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&covariates)?;
    let has = |name: &str| present.iter().any(|n| n == name);
    if !has(c::FLR_AREA) {
        return Err(PipelineError::ColumnMissing {
            column:  c::FLR_AREA.to_string(),
            context: "sample FKT".to_string(),
        });
    }
    let mut select = vec![col(c::BUILDING_ID)];
    select.extend(STRATIFIERS.iter().filter(|s| has(**s)).map(|s| col(*s)));
    select.extend(
        FKT_GEOGRAPHY
            .iter()
            .filter(|g| has(**g))
            .map(|g| col(*g).cast(DataType::String)),
    );
    select.push(col(c::FLR_AREA).cast(DataType::Float64).alias(TRUTH_SQFT));
    select.push(if has(c::WEIGHT) {
        col(c::WEIGHT).cast(DataType::Float64)
    } else {
        lit(1.0).alias(c::WEIGHT)
    });
    let df = kernel::materialize(covariates.select(select), "sample FKT")?;
    Ok(attach_state_and_climate(df)?.lazy())
}

/// `<diagnostics>/apportionment_shortfall.csv`
pub fn write_shortfall_report(path: &Path, report: &[BucketShortfall]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in report {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(entries: &[(&str, &[usize])]) -> BTreeMap<String, Vec<usize>> {
        entries.iter().map(|(b, r)| (b.to_string(), r.to_vec())).collect()
    }

    #[test]
    fn empty_buckets_are_reported_and_removed() {
        let mut truth = buckets(&[("a", &[0, 1]), ("b", &[2])]);
        let sims: BTreeMap<String, Vec<BuildingId>> = [("a".to_string(), vec![1, 2])].into();
        let report = shortfalls(&mut truth, &[10.0, 20.0, 30.0], &sims);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].bucket, "b");
        assert_eq!(report[0].truth_sqft, 30.0);
        assert!(!truth.contains_key("b"));
    }

    #[test]
    fn micro_schools_need_three_larger_schools() {
        let types: Vec<String> = ["PrimarySchool"; 5].iter().map(|s| s.to_string()).collect();
        let sqft = [1000.0, 5000.0, 6000.0, 7000.0, 1500.0];
        let mut truth = buckets(&[("s", &[0, 1, 2, 3, 4])]);
        assert_eq!(drop_micro_schools(&mut truth, &sqft, &types), 2);
        assert_eq!(truth["s"], vec![1, 2, 3]);

        let mut small = buckets(&[("s", &[0, 1, 2])]);
        assert_eq!(drop_micro_schools(&mut small, &sqft, &types), 0);
    }
}
