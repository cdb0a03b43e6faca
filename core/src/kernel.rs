//! Lazy pipeline kernel: checkpoints, on-disk caches, canonical column
//! order and the expression helpers the stages compose with.
//!
//! RULES:
//!   - Stages pass LazyFrames. Only the kernel collects, and only at a
//!     named checkpoint (ingest cache, FKT cache, per-partition export).
//!   - Between checkpoints columns are added by expression composition only.
//!   - Cache paths are deterministic; reruns reuse what is on disk.

use crate::{
    columns::{self as c, EJ_PERCENTILE_COLUMNS},
    error::{PipelineError, PipelineResult},
    types::{BuildingId, UpgradeId},
};
use polars::{io::HiveOptions, prelude::*};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const WIDE_CACHE_DIR: &str = "cached_wide_by_upgrade";
pub const FKT_CACHE_DIR:  &str = "cached_fkt";

// ── Cache paths ─────────────────────────────────────────────────────────────

/// `<output_dir>/cached_wide_by_upgrade/upgrade=<id>/results.parquet`
pub fn upgrade_cache_path(output_dir: &Path, upgrade_id: UpgradeId) -> PathBuf {
    output_dir
        .join(WIDE_CACHE_DIR)
        .join(format!("upgrade={upgrade_id}"))
        .join("results.parquet")
}

/// `<output_dir>/cached_fkt/seed=<seed>/inputs=<digest>/fkt.parquet`
///
/// A different seed or a different input digest never reuses draws.
pub fn fkt_cache_path(output_dir: &Path, seed: u64, input_digest: &str) -> PathBuf {
    output_dir
        .join(FKT_CACHE_DIR)
        .join(format!("seed={seed}"))
        .join(format!("inputs={input_digest}"))
        .join("fkt.parquet")
}

/// Hex SHA-256 over labelled byte chunks. Labels keep adjacent chunks from
/// running together.
pub fn input_digest<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut hasher = Sha256::new();
    for (label, bytes) in chunks {
        hasher.update(label.as_bytes());
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

// ── IO ──────────────────────────────────────────────────────────────────────

pub fn scan_parquet(path: &Path) -> PipelineResult<LazyFrame> {
    if !path.exists() {
        return Err(PipelineError::missing_input(path));
    }
    // Cache directories are named `key=value`; those are not data columns.
    let args = ScanArgsParquet {
        hive_options: HiveOptions {
            enabled: Some(false),
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(LazyFrame::scan_parquet(path, args)?)
}

pub fn read_csv(path: &Path) -> PipelineResult<DataFrame> {
    if !path.exists() {
        return Err(PipelineError::missing_input(path));
    }
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    log::debug!("Read {} rows from {}", df.height(), path.display());
    Ok(df)
}

fn create_parent(path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_parquet(df: &mut DataFrame, path: &Path) -> PipelineResult<()> {
    create_parent(path)?;
    let file = File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

pub fn write_csv(df: &mut DataFrame, path: &Path, separator: u8) -> PipelineResult<()> {
    create_parent(path)?;
    let file = File::create(path)?;
    CsvWriter::new(file)
        .include_header(true)
        .with_separator(separator)
        .finish(df)?;
    Ok(())
}

// ── Checkpoints ─────────────────────────────────────────────────────────────

/// Collect a lazy frame at a named checkpoint.
pub fn materialize(lf: LazyFrame, label: &str) -> PipelineResult<DataFrame> {
    let df = lf.collect()?;
    log::info!("Checkpoint {label}: {} rows x {} columns", df.height(), df.width());
    Ok(df)
}

/// Collect, persist to `path`, and hand back a scan of the persisted file.
pub fn checkpoint_parquet(lf: LazyFrame, path: &Path, label: &str) -> PipelineResult<LazyFrame> {
    let mut df = materialize(lf, label)?;
    write_parquet(&mut df, path)?;
    log::debug!("Checkpoint {label} written to {}", path.display());
    scan_parquet(path)
}

/// Sort a materialized frame by `by`, in order.
pub fn sort_frame(df: DataFrame, by: &[String]) -> PipelineResult<DataFrame> {
    let exprs: Vec<Expr> = by.iter().map(|n| col(n.as_str())).collect();
    Ok(df.lazy().sort_by_exprs(exprs, SortMultipleOptions::default()).collect()?)
}

pub fn schema_of(lf: &LazyFrame) -> PipelineResult<SchemaRef> {
    let mut lf = lf.clone();
    Ok(lf.collect_schema()?)
}

pub fn column_names(lf: &LazyFrame) -> PipelineResult<Vec<String>> {
    Ok(schema_of(lf)?.iter_names().map(|n| n.to_string()).collect())
}

pub fn frame_column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|n| n.to_string()).collect()
}

// ── Schema harmonisation ────────────────────────────────────────────────────

/// Union the columns of several frames. Numeric disagreements widen to
/// Float64; any other disagreement is a SchemaConflict.
pub fn harmonize_and_concat(frames: Vec<(UpgradeId, LazyFrame)>) -> PipelineResult<LazyFrame> {
    let mut schemas = Vec::with_capacity(frames.len());
    for (upgrade_id, lf) in &frames {
        schemas.push((*upgrade_id, schema_of(lf)?));
    }

    let mut order: Vec<String> = Vec::new();
    let mut targets: Vec<(DataType, UpgradeId)> = Vec::new();
    for (upgrade_id, schema) in &schemas {
        for (name, dtype) in schema.iter() {
            let name = name.to_string();
            match order.iter().position(|n| *n == name) {
                None => {
                    order.push(name);
                    targets.push((dtype.clone(), *upgrade_id));
                }
                Some(idx) => {
                    let (current, first_upgrade) = &targets[idx];
                    if current == dtype || *dtype == DataType::Null {
                        continue;
                    }
                    if *current == DataType::Null {
                        targets[idx] = (dtype.clone(), *upgrade_id);
                    } else if current.is_numeric() && dtype.is_numeric() {
                        targets[idx] = (DataType::Float64, *first_upgrade);
                    } else {
                        return Err(PipelineError::SchemaConflict {
                            column:     name,
                            upgrade_id: *upgrade_id,
                            left:       format!("{current} (upgrade {first_upgrade})"),
                            right:      format!("{dtype}"),
                        });
                    }
                }
            }
        }
    }

    let mut aligned = Vec::with_capacity(frames.len());
    for ((_, lf), (_, schema)) in frames.into_iter().zip(schemas.iter()) {
        let exprs: Vec<Expr> = order
            .iter()
            .zip(targets.iter())
            .map(|(name, (target, _))| match schema.get(name.as_str()) {
                Some(dtype) if dtype == target => col(name.as_str()),
                Some(_) => col(name.as_str()).cast(target.clone()),
                None => lit(NULL).cast(target.clone()).alias(name.as_str()),
            })
            .collect();
        aligned.push(lf.select(exprs));
    }
    Ok(concat(aligned, UnionArgs::default())?)
}

// ── Expression helpers ──────────────────────────────────────────────────────

/// Null-safe sum of several expressions; an empty list sums to 0.
pub fn sum_exprs(exprs: Vec<Expr>) -> Expr {
    exprs
        .into_iter()
        .map(|e| e.fill_null(lit(0.0)))
        .reduce(|acc, e| acc + e)
        .unwrap_or_else(|| lit(0.0))
}

/// `num / den`, 0 where the denominator is 0 or null.
pub fn safe_divide(num: Expr, den: Expr) -> Expr {
    when(den.clone().eq(lit(0.0)).or(den.clone().is_null()))
        .then(lit(0.0))
        .otherwise(num.cast(DataType::Float64) / den.cast(DataType::Float64))
}

pub fn is_one_of(expr: Expr, values: &[&str]) -> Expr {
    values
        .iter()
        .map(|v| expr.clone().eq(lit(*v)))
        .reduce(|acc, e| acc.or(e))
        .unwrap_or_else(|| lit(false))
}

const EXCLUDED_MARKER: &str = "__excluded";

/// Drop every row whose `building_id` is in `ids`.
pub fn exclude_buildings(lf: LazyFrame, ids: &BTreeSet<BuildingId>) -> PipelineResult<LazyFrame> {
    if ids.is_empty() {
        return Ok(lf);
    }
    let marks = df!(
        c::BUILDING_ID  => ids.iter().copied().collect::<Vec<i64>>(),
        EXCLUDED_MARKER => vec![true; ids.len()],
    )?;
    Ok(lf
        .join(
            marks.lazy(),
            [col(c::BUILDING_ID)],
            [col(c::BUILDING_ID)],
            JoinArgs::new(JoinType::Left),
        )
        .filter(col(EXCLUDED_MARKER).is_null())
        .drop([EXCLUDED_MARKER]))
}

// ── Value extraction ────────────────────────────────────────────────────────

fn series_of<'a>(df: &'a DataFrame, name: &str, context: &str) -> PipelineResult<&'a Series> {
    df.column(name)
        .map(|c| c.as_materialized_series())
        .map_err(|_| PipelineError::ColumnMissing {
            column:  name.to_string(),
            context: context.to_string(),
        })
}

pub fn str_values(df: &DataFrame, name: &str, context: &str) -> PipelineResult<Vec<Option<String>>> {
    let series = series_of(df, name, context)?.cast(&DataType::String)?;
    Ok(series.str()?.into_iter().map(|v| v.map(str::to_string)).collect())
}

pub fn f64_values(df: &DataFrame, name: &str, context: &str) -> PipelineResult<Vec<Option<f64>>> {
    let series = series_of(df, name, context)?.cast(&DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}

pub fn i64_values(df: &DataFrame, name: &str, context: &str) -> PipelineResult<Vec<Option<i64>>> {
    let series = series_of(df, name, context)?.cast(&DataType::Int64)?;
    Ok(series.i64()?.into_iter().collect())
}

pub fn bool_values(df: &DataFrame, name: &str, context: &str) -> PipelineResult<Vec<Option<bool>>> {
    let series = series_of(df, name, context)?.cast(&DataType::Boolean)?;
    Ok(series.bool()?.into_iter().collect())
}

// ── Canonical column order ──────────────────────────────────────────────────

const IDENTITY_ORDER: [&str; 9] = [
    c::BUILDING_ID,
    c::UPGRADE_ID,
    c::WEIGHT,
    c::FLR_AREA,
    c::WTD_FLR_AREA,
    c::UPGRADE_NAME,
    c::APPLICABILITY,
    c::COMPLETION_STATUS,
    c::DATASET,
];

const GEOGRAPHY_COLUMNS: [&str; 14] = [
    c::TRACT,
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
    c::UTILITY_ID,
    c::EJ_DISADVANTAGED,
];

fn order_rank(name: &str) -> usize {
    if let Some(pos) = IDENTITY_ORDER.iter().position(|n| *n == name) {
        return pos;
    }
    let base = IDENTITY_ORDER.len();
    if name.starts_with("applicability") {
        return base;
    }
    if GEOGRAPHY_COLUMNS.contains(&name) || EJ_PERCENTILE_COLUMNS.contains(&name) {
        return base + 1;
    }
    if name.starts_with("in.") {
        return base + 2;
    }
    if let Some(rest) = name.strip_prefix("out.") {
        let rank = if rest.contains("_intensity") {
            5
        } else if rest.contains(".energy_consumption") || rest.contains(".energy_savings") {
            3
        } else if rest.contains("peak_") {
            4
        } else if rest.starts_with("qoi.") {
            6
        } else if rest.starts_with("emissions.") {
            7
        } else if rest.starts_with("utility_bills.") {
            8
        } else if rest.starts_with("params.") {
            9
        } else {
            10
        };
        return base + rank;
    }
    if name.starts_with("calc.") {
        return base + 11;
    }
    base + 12
}

/// Canonical export order. Stable within each group.
pub fn canonical_order(names: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = names.to_vec();
    ordered.sort_by_key(|n| order_rank(n));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_columns_lead() {
        let names: Vec<String> = [
            "calc.weighted.sqft..ft2",
            "out.electricity.total.energy_consumption..kwh",
            "in.comstock_building_type",
            "upgrade_id",
            "building_id",
            "out.emissions.natural_gas..co2e_kg",
            "in.state",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let ordered = canonical_order(&names);
        assert_eq!(ordered[0], "building_id");
        assert_eq!(ordered[1], "upgrade_id");
        assert_eq!(ordered[2], "calc.weighted.sqft..ft2");
        assert_eq!(ordered[3], "in.state");
        assert_eq!(ordered[4], "in.comstock_building_type");
        assert_eq!(ordered[6], "out.emissions.natural_gas..co2e_kg");
    }

    #[test]
    fn cache_paths_are_hive_style() {
        let p = upgrade_cache_path(Path::new("/out"), 3);
        assert!(p.to_string_lossy().contains("cached_wide_by_upgrade/upgrade=3/"));
        let f = fkt_cache_path(Path::new("/out"), 42, "00ff");
        assert!(f.to_string_lossy().contains("cached_fkt/seed=42/inputs=00ff/"));
    }

    #[test]
    fn excluded_buildings_leave_the_frame() {
        let lf = df!(
            c::BUILDING_ID => [1i64, 2, 3],
            c::WEIGHT      => [1.0f64, 2.0, 3.0],
        )
        .expect("frame")
        .lazy();
        let kept = materialize(
            exclude_buildings(lf, &BTreeSet::from([2i64, 9])).expect("exclude"),
            "excluded",
        )
        .expect("collect");
        let kept = sort_frame(kept, &[c::BUILDING_ID.to_string()]).expect("sort");
        assert_eq!(frame_column_names(&kept), vec![c::BUILDING_ID.to_string(), c::WEIGHT.to_string()]);
        assert_eq!(i64_values(&kept, c::BUILDING_ID, "test").expect("ids"), vec![Some(1), Some(3)]);
    }

    #[test]
    fn input_digest_tracks_every_chunk() {
        let a = input_digest([("truth", b"1,2".as_slice()), ("sample", b"3".as_slice())]);
        let b = input_digest([("truth", b"1,2".as_slice()), ("sample", b"4".as_slice())]);
        let shifted = input_digest([("truth", b"1,".as_slice()), ("sample", b"23".as_slice())]);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_ne!(a, shifted, "chunk boundaries are part of the digest");
        assert_eq!(a, input_digest([("truth", b"1,2".as_slice()), ("sample", b"3".as_slice())]));
    }

    #[test]
    fn cached_frames_keep_their_own_columns_under_any_seed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut df = df!(
            c::BUILDING_ID => [1i64, 2],
            c::WEIGHT      => [0.5f64, 1.5],
        )
        .expect("frame");
        let paths = [
            fkt_cache_path(dir.path(), u64::MAX - 1, "abc"),
            fkt_cache_path(dir.path(), 7, "abc"),
            upgrade_cache_path(dir.path(), 12),
        ];
        for path in &paths {
            write_parquet(&mut df, path).expect("write");
            let reloaded = materialize(scan_parquet(path).expect("scan"), "reload").expect("collect");
            assert_eq!(
                frame_column_names(&reloaded),
                vec![c::BUILDING_ID.to_string(), c::WEIGHT.to_string()],
                "{}",
                path.display()
            );
            assert_eq!(reloaded.height(), 2);
        }
    }
}
