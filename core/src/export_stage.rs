//! ExportPlanner: the partitioned fan-out over
//! (entry × upgrade × partition × aggregation × tier × format).
//!
//! PER-UPGRADE PASS (one per level-1 partition value, baseline first):
//!   NotStarted → ResolvedBills → AggregatedWeights → Joined → Weighted
//!   → Enriched → WriteQueued → Written
//!
//! RULES:
//!   - Transitions are linear. Anything else is an ExportStateViolation.
//!   - Writes are queued per entry and flushed only once every pass of the
//!     entry reached WriteQueued. A failed pass flushes nothing.
//!   - Rows in every file are sorted by building_id (or by the group keys
//!     for aggregated files).
//!   - The baseline pass caches its bills; later passes difference against it.

use crate::{
    column_registry::{ColumnDefinition, ColumnRegistry},
    columns::{self as c, Fuel},
    config::{AggregationLevel, ExportEntry, ExportPlan, WeightedUnits},
    error::{PipelineError, PipelineResult},
    geo_stage::{self, GeographyTables},
    kernel::{self, frame_column_names, safe_divide},
    naming,
    types::{ColumnDataType, DataTier, FileFormat, UpgradeId, BASELINE_UPGRADE},
    units::conv_fact,
    utility_bill_stage,
};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

pub const AGG_SUFFIX:   &str = "_agg";
pub const BASIC_SUFFIX: &str = "_basic";
pub const NATIONAL:     &str = "national";

const BASELINE_BILL_SUFFIX: &str = "__baseline_bill";
const NULL_PARTITION: &str = "none";

/// Columns every export file keeps regardless of tier.
const ALWAYS_KEEP: [&str; 8] = [
    c::BUILDING_ID,
    c::UPGRADE_ID,
    c::WEIGHT,
    c::UPGRADE_NAME,
    c::APPLICABILITY,
    c::COMPLETION_STATUS,
    c::DATASET,
    c::MODELS_USED,
];

// ── Pass state machine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExportPassState {
    NotStarted,
    ResolvedBills,
    AggregatedWeights,
    Joined,
    Weighted,
    Enriched,
    WriteQueued,
    Written,
}

impl ExportPassState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted        => "NotStarted",
            Self::ResolvedBills     => "ResolvedBills",
            Self::AggregatedWeights => "AggregatedWeights",
            Self::Joined            => "Joined",
            Self::Weighted          => "Weighted",
            Self::Enriched          => "Enriched",
            Self::WriteQueued       => "WriteQueued",
            Self::Written           => "Written",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::NotStarted        => Some(Self::ResolvedBills),
            Self::ResolvedBills     => Some(Self::AggregatedWeights),
            Self::AggregatedWeights => Some(Self::Joined),
            Self::Joined            => Some(Self::Weighted),
            Self::Weighted          => Some(Self::Enriched),
            Self::Enriched          => Some(Self::WriteQueued),
            Self::WriteQueued       => Some(Self::Written),
            Self::Written           => None,
        }
    }
}

/// One upgrade's pass over one level-1 partition value.
#[derive(Debug, Clone)]
pub struct ExportPass {
    pub upgrade_id: UpgradeId,
    pub partition:  Option<String>,
    state:          ExportPassState,
}

impl ExportPass {
    pub fn new(upgrade_id: UpgradeId, partition: Option<String>) -> Self {
        Self {
            upgrade_id,
            partition,
            state: ExportPassState::NotStarted,
        }
    }

    pub fn state(&self) -> ExportPassState {
        self.state
    }

    /// Move to `to`, which must be the immediate successor of the current state.
    pub fn advance(&mut self, to: ExportPassState) -> PipelineResult<()> {
        if self.state.next() != Some(to) {
            return Err(PipelineError::ExportStateViolation {
                upgrade_id: self.upgrade_id,
                from:       self.state.name(),
                to:         to.name(),
            });
        }
        log::debug!(
            "Export pass upgrade {} ({}): {} -> {}",
            self.upgrade_id,
            self.partition.as_deref().unwrap_or("all"),
            self.state.name(),
            to.name()
        );
        self.state = to;
        Ok(())
    }
}

// ── Export catalog ──────────────────────────────────────────────────────────

/// Definitions for columns the registry does not carry. Registry entries
/// always win.
#[derive(Debug, Clone, Default)]
pub struct ExportCatalog {
    definitions: BTreeMap<String, ColumnDefinition>,
}

impl ExportCatalog {
    pub fn new(derived: &[ColumnDefinition]) -> Self {
        Self {
            definitions: derived
                .iter()
                .map(|d| (d.new_name_with_units(), d.clone()))
                .collect(),
        }
    }

    pub fn get<'a>(&'a self, registry: &'a ColumnRegistry, name: &str) -> Option<&'a ColumnDefinition> {
        registry.get(name).or_else(|| self.definitions.get(name))
    }

    pub fn add_derived(
        &mut self,
        registry: &ColumnRegistry,
        name: &str,
        data_type: ColumnDataType,
        description: String,
        source: Option<&str>,
    ) {
        if registry.contains(name) || self.definitions.contains_key(name) {
            return;
        }
        let source_def = source.and_then(|s| self.get(registry, s)).cloned();
        self.definitions.insert(
            name.to_string(),
            ColumnDefinition::derived(name, data_type, description, source_def.as_ref()),
        );
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

pub fn upgrade_label(upgrade_id: UpgradeId) -> String {
    if upgrade_id == BASELINE_UPGRADE {
        "baseline".to_string()
    } else {
        format!("upgrade{upgrade_id:02}")
    }
}

fn path_safe(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

/// `<prefixes>_<baseline|upgradeNN>[_agg...][_basic].<ext>`
pub fn output_file_name(
    prefixes: &[String],
    upgrade_id: UpgradeId,
    agg_suffix: &str,
    tier: DataTier,
    format: FileFormat,
) -> String {
    let mut stem = String::new();
    for prefix in prefixes {
        stem.push_str(&path_safe(prefix));
        stem.push('_');
    }
    stem.push_str(&upgrade_label(upgrade_id));
    stem.push_str(agg_suffix);
    if tier == DataTier::Basic {
        stem.push_str(BASIC_SUFFIX);
    }
    format!("{stem}.{}", format.extension())
}

/// `<root>/<dir>/<tier>/<format>/<label>=<value>/...`
pub fn partition_dir(
    root: &Path,
    entry: &ExportEntry,
    tier: DataTier,
    format: FileFormat,
    values: &[String],
) -> PathBuf {
    let mut dir = root
        .join(&entry.dir)
        .join(tier.name())
        .join(format.extension());
    for (partition, value) in entry.partition_cols.iter().zip(values) {
        dir = dir.join(format!("{}={}", partition.label, path_safe(value)));
    }
    dir
}

/// Suffix for an aggregation over `column`.
pub fn aggregation_suffix(entry: &ExportEntry, column: &str) -> String {
    if entry.partition_cols.iter().any(|p| p.column == column) {
        AGG_SUFFIX.to_string()
    } else {
        let short = naming::strip_units(column);
        let short = short.strip_prefix("in.").unwrap_or(short);
        format!("{AGG_SUFFIX}_by_{}", short.replace('.', "_"))
    }
}

// ── Write queue ─────────────────────────────────────────────────────────────

pub struct WriteJob {
    pub path:   PathBuf,
    pub format: FileFormat,
    pub frame:  DataFrame,
}

impl WriteJob {
    fn write(&self) -> PipelineResult<PathBuf> {
        let mut df = self.frame.clone();
        match self.format {
            FileFormat::Csv => kernel::write_csv(&mut df, &self.path, b',')?,
            FileFormat::Parquet => kernel::write_parquet(&mut df, &self.path)?,
        }
        log::debug!("Wrote {} rows to {}", df.height(), self.path.display());
        Ok(self.path.clone())
    }
}

/// Write every queued job on a bounded worker pool. Blocks until done.
pub fn flush(jobs: Vec<WriteJob>, workers: usize) -> PipelineResult<Vec<PathBuf>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("export worker pool: {e}")))?;
    pool.install(|| jobs.par_iter().map(WriteJob::write).collect())
}

// ── Exporter ────────────────────────────────────────────────────────────────

pub struct ExportContext<'a> {
    pub registry:             &'a ColumnRegistry,
    pub weighted_units:       &'a WeightedUnits,
    pub geography:            Option<&'a GeographyTables>,
    pub tract_utilities:      Option<&'a DataFrame>,
    pub output_dir:           &'a Path,
    pub workers:              usize,
    pub object_store_profile: Option<&'a str>,
}

/// Everything the dictionary writer and the ledger need after export.
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub files:    Vec<PathBuf>,
    /// Every exported column, in canonical order.
    pub columns:  Vec<String>,
    /// Distinct string values seen per column, capped past the threshold.
    pub observed: BTreeMap<String, BTreeSet<String>>,
    pub catalog:  ExportCatalog,
}

pub struct Exporter<'a> {
    ctx:                 ExportContext<'a>,
    catalog:             ExportCatalog,
    savings_to_weighted: BTreeMap<String, String>,
    warned:              BTreeSet<String>,
    observed:            BTreeMap<String, BTreeSet<String>>,
    exported:            BTreeSet<String>,
    files:               Vec<PathBuf>,
    baseline_bills:      HashMap<Option<String>, DataFrame>,
}

impl<'a> Exporter<'a> {
    pub fn new(
        ctx: ExportContext<'a>,
        derived: &[ColumnDefinition],
        savings_to_weighted: &BTreeMap<String, String>,
    ) -> Self {
        if let Some(profile) = ctx.object_store_profile {
            log::info!("Object-store profile '{profile}' recorded; outputs go to {}", ctx.output_dir.display());
        }
        let mut catalog = ExportCatalog::new(derived);
        let identity = [
            (c::BUILDING_ID, ColumnDataType::Number, "Simulated building identifier"),
            (c::UPGRADE_ID, ColumnDataType::Number, "Upgrade identifier; 0 is the baseline"),
            (c::WEIGHT, ColumnDataType::Number, "Number of real buildings each row represents"),
            (c::UPGRADE_NAME, ColumnDataType::String, "Upgrade name"),
            (c::APPLICABILITY, ColumnDataType::Boolean, "Whether the upgrade applied to the building"),
            (c::COMPLETION_STATUS, ColumnDataType::String, "Simulation completion status"),
            (c::DATASET, ColumnDataType::String, "Dataset label"),
            (c::MODELS_USED, ColumnDataType::Number, "Number of simulated models aggregated into the row"),
        ];
        for (name, dtype, description) in identity {
            catalog.add_derived(ctx.registry, name, dtype, description.to_string(), None);
        }
        Self {
            ctx,
            catalog,
            savings_to_weighted: savings_to_weighted.clone(),
            warned: BTreeSet::new(),
            observed: BTreeMap::new(),
            exported: BTreeSet::new(),
            files: Vec::new(),
            baseline_bills: HashMap::new(),
        }
    }

    /// Run every entry of the plan.
    pub fn run(
        &mut self,
        results: &LazyFrame,
        fkt: &LazyFrame,
        upgrade_ids: &[UpgradeId],
        plan: &ExportPlan,
    ) -> PipelineResult<()> {
        for entry in &plan.entries {
            self.export_entry(results, fkt, upgrade_ids, entry)?;
        }
        Ok(())
    }

    pub fn finish(self) -> ExportReport {
        let columns: Vec<String> = self.exported.into_iter().collect();
        ExportReport {
            files:    self.files,
            columns:  kernel::canonical_order(&columns),
            observed: self.observed,
            catalog:  self.catalog,
        }
    }

    fn export_entry(
        &mut self,
        results: &LazyFrame,
        fkt: &LazyFrame,
        upgrade_ids: &[UpgradeId],
        entry: &ExportEntry,
    ) -> PipelineResult<()> {
        if entry.widest_tier().is_none() || entry.file_formats.is_empty() {
            log::warn!("Export entry '{}' requests no tiers or formats; skipped", entry.dir);
            return Ok(());
        }
        let fkt = utility_bill_stage::attach_utility(fkt.clone(), self.ctx.tract_utilities)?;
        let fkt_cols = kernel::column_names(&fkt)?;
        for partition in &entry.partition_cols {
            if !fkt_cols.iter().any(|n| *n == partition.column) {
                return Err(PipelineError::ColumnMissing {
                    column:  partition.column.clone(),
                    context: format!("export entry '{}' partitions", entry.dir),
                });
            }
        }
        let level1 = level1_values(&fkt, entry)?;
        let mut ids: BTreeSet<UpgradeId> = upgrade_ids.iter().copied().collect();
        ids.insert(BASELINE_UPGRADE);
        log::info!(
            "Export entry '{}': {} upgrade(s) x {} level-1 partition(s)",
            entry.dir,
            ids.len(),
            level1.len()
        );

        self.baseline_bills.clear();
        let national = entry.aggregation_levels.contains(&AggregationLevel::National);
        let mut jobs = Vec::new();
        let mut passes = Vec::new();
        for upgrade_id in ids {
            let mut slices = Vec::new();
            for value in &level1 {
                let mut pass = ExportPass::new(upgrade_id, value.clone());
                let slice = self.process_slice(results, &fkt, entry, &mut pass)?;
                self.queue_slice(&slice, entry, upgrade_id, &mut jobs)?;
                pass.advance(ExportPassState::WriteQueued)?;
                passes.push(pass);
                if national {
                    slices.push((upgrade_id, slice.lazy()));
                }
            }
            if national && !slices.is_empty() {
                let all = kernel::materialize(
                    kernel::harmonize_and_concat(slices)?,
                    &format!("export '{}' national upgrade {upgrade_id}", entry.dir),
                )?;
                self.queue_national(&all, entry, upgrade_id, &mut jobs)?;
            }
        }

        let queued = jobs.len();
        let written = flush(jobs, self.ctx.workers)?;
        for pass in &mut passes {
            pass.advance(ExportPassState::Written)?;
        }
        log::info!("Export entry '{}': {queued} file(s) written", entry.dir);
        self.files.extend(written);
        Ok(())
    }

    // ── One pass ────────────────────────────────────────────────────────────

    fn process_slice(
        &mut self,
        results: &LazyFrame,
        fkt: &LazyFrame,
        entry: &ExportEntry,
        pass: &mut ExportPass,
    ) -> PipelineResult<DataFrame> {
        let upgrade_id = pass.upgrade_id;
        let partitions: Vec<String> = entry.partition_cols.iter().map(|p| p.column.clone()).collect();

        let mut fkt_slice = fkt.clone();
        if let (Some(first), Some(value)) = (entry.partition_cols.first(), pass.partition.as_deref()) {
            fkt_slice = fkt_slice.filter(col(first.column.as_str()).cast(DataType::String).eq(lit(value)));
        }
        let results_u = results.clone().filter(col(c::UPGRADE_ID).eq(lit(upgrade_id)));
        let result_schema = kernel::schema_of(&results_u)?;
        let all_cols: Vec<String> = result_schema.iter_names().map(|n| n.to_string()).collect();
        let raw_bills = utility_bill_stage::raw_bill_columns(&all_cols);
        let tier = entry.widest_tier().unwrap_or(DataTier::Detailed);
        let result_cols = self.slice_inputs(&result_schema, &partitions, &raw_bills, tier)?;
        let results_u = results_u.select(result_cols.iter().map(|n| col(n.as_str())).collect::<Vec<_>>());

        // Bills on FKT rows.
        let fkt_cols = kernel::column_names(&fkt_slice)?;
        let mut keep: Vec<String> = vec![c::BUILDING_ID.to_string(), c::WEIGHT.to_string()];
        for name in partitions.iter().map(String::as_str).chain([c::STATE, c::UTILITY_ID]) {
            if fkt_cols.iter().any(|n| n == name) && !keep.iter().any(|k| k == name) {
                keep.push(name.to_string());
            }
        }
        let select: Vec<Expr> = keep
            .iter()
            .map(|n| {
                if partitions.contains(n) {
                    col(n.as_str()).cast(DataType::String)
                } else {
                    col(n.as_str())
                }
            })
            .collect();
        let mut rows = fkt_slice.select(select);
        if !raw_bills.is_empty() {
            let mut select = vec![col(c::BUILDING_ID)];
            select.extend(raw_bills.iter().map(|n| col(*n)));
            rows = rows.join(
                results_u.clone().select(select),
                [col(c::BUILDING_ID)],
                [col(c::BUILDING_ID)],
                JoinArgs::new(JoinType::Left),
            );
        }
        let rows = kernel::materialize(rows, &format!("export bills upgrade {upgrade_id}"))?;
        let rows = utility_bill_stage::resolve_bills(rows)?;
        pass.advance(ExportPassState::ResolvedBills)?;

        // Sum weights per building and partition.
        let aggregated = self.aggregate_weights(rows, &partitions)?;
        let aggregated = self.bill_savings(aggregated, &partitions, pass)?;
        pass.advance(ExportPassState::AggregatedWeights)?;

        // Join back to results.
        let agg_cols = kernel::column_names(&aggregated)?;
        let result_select: Vec<Expr> = result_cols
            .iter()
            .filter(|n| n.as_str() == c::BUILDING_ID || !agg_cols.contains(n))
            .filter(|n| !raw_bills.iter().any(|r| *r == n.as_str()))
            .map(|n| col(n.as_str()))
            .collect();
        let joined = aggregated.join(
            results_u.select(result_select),
            [col(c::BUILDING_ID)],
            [col(c::BUILDING_ID)],
            JoinArgs::new(JoinType::Inner),
        );
        pass.advance(ExportPassState::Joined)?;

        // Weighted values, then the bill metrics that read them.
        let schema = kernel::schema_of(&joined)?;
        let weighted = self.weighted_exprs(&schema)?;
        let joined = joined.with_columns(weighted);
        let metrics = self.bill_metric_exprs(&kernel::column_names(&joined)?)?;
        let joined = joined.with_columns(metrics);
        pass.advance(ExportPassState::Weighted)?;

        let enriched = match (self.ctx.geography, geo_stage::finest_key(&partitions)) {
            (Some(tables), Some(key)) => geo_stage::enrich(joined, key, tables)?,
            _ => joined,
        };
        pass.advance(ExportPassState::Enriched)?;

        let label = format!(
            "export '{}' {} {}",
            entry.dir,
            upgrade_label(upgrade_id),
            pass.partition.as_deref().unwrap_or("all")
        );
        let df = kernel::materialize(enriched, &label)?;
        self.observe(&df)?;
        Ok(df)
    }

    fn aggregate_weights(&mut self, rows: DataFrame, partitions: &[String]) -> PipelineResult<LazyFrame> {
        let names = frame_column_names(&rows);
        let costs: BTreeSet<String> = c::bill_cost_cols().into_iter().collect();
        let mut keys = vec![col(c::BUILDING_ID)];
        keys.extend(partitions.iter().map(|p| col(p.as_str())));

        let weight = || col(c::WEIGHT);
        let mut aggs = vec![weight().sum().alias(c::WEIGHT)];
        for name in names.iter().filter(|n| n.starts_with("out.utility_bills.")) {
            if costs.contains(name) {
                aggs.push(
                    safe_divide((col(name.as_str()) * weight()).sum(), weight().sum()).alias(name.as_str()),
                );
                self.catalog.add_derived(
                    self.ctx.registry,
                    name,
                    ColumnDataType::Number,
                    "Utility bill cost, weighted average over assigned utilities".into(),
                    None,
                );
            } else {
                aggs.push(col(name.as_str()).first());
                let dtype = if name.ends_with("_num_bills") {
                    ColumnDataType::Number
                } else {
                    ColumnDataType::String
                };
                self.catalog.add_derived(self.ctx.registry, name, dtype, "Utility bill detail".into(), None);
            }
        }
        Ok(rows.lazy().group_by(keys).agg(aggs))
    }

    /// Baseline pass: cache the bills and write explicit zero savings.
    /// Later passes: savings = baseline − upgrade.
    fn bill_savings(
        &mut self,
        aggregated: LazyFrame,
        partitions: &[String],
        pass: &ExportPass,
    ) -> PipelineResult<LazyFrame> {
        let present = kernel::column_names(&aggregated)?;
        let costs: Vec<String> = c::bill_cost_cols()
            .into_iter()
            .filter(|n| present.contains(n))
            .collect();
        if costs.is_empty() {
            return Ok(aggregated);
        }

        let mut savings = Vec::with_capacity(costs.len());
        for cost in &costs {
            let name = naming::col_name_to_savings(cost)?;
            if let Some(target) = self.ctx.weighted_units.target_for(&naming::units_from_col_name(&name)) {
                let weighted = naming::col_name_to_weighted_savings(&name, Some(target))?;
                self.savings_to_weighted.insert(name.clone(), weighted);
            }
            self.catalog.add_derived(
                self.ctx.registry,
                &name,
                ColumnDataType::Number,
                format!("Savings in {cost} versus the baseline"),
                Some(cost),
            );
            savings.push((cost.clone(), name));
        }

        let mut keys: Vec<String> = vec![c::BUILDING_ID.to_string()];
        keys.extend(partitions.iter().cloned());

        if pass.upgrade_id == BASELINE_UPGRADE {
            let df = kernel::materialize(aggregated, "export baseline bills")?;
            let mut cached: Vec<String> = keys.clone();
            cached.extend(costs.iter().cloned());
            self.baseline_bills.insert(pass.partition.clone(), df.select(cached)?);
            let zeros: Vec<Expr> = savings.iter().map(|(_, s)| lit(0.0).alias(s.as_str())).collect();
            return Ok(df.lazy().with_columns(zeros));
        }

        let base = self.baseline_bills.get(&pass.partition).cloned().ok_or_else(|| {
            PipelineError::missing_input(format!(
                "baseline bills for partition '{}'",
                pass.partition.as_deref().unwrap_or("all")
            ))
        })?;
        let mut base_select: Vec<Expr> = keys.iter().map(|k| col(k.as_str())).collect();
        base_select.extend(
            costs
                .iter()
                .map(|cost| col(cost.as_str()).alias(format!("{cost}{BASELINE_BILL_SUFFIX}").as_str())),
        );
        let key_exprs: Vec<Expr> = keys.iter().map(|k| col(k.as_str())).collect();
        let joined = aggregated.join(
            base.lazy().select(base_select),
            key_exprs.clone(),
            key_exprs,
            JoinArgs::new(JoinType::Left),
        );
        let mut select: Vec<Expr> = present.iter().map(|n| col(n.as_str())).collect();
        for (cost, name) in &savings {
            let base = col(format!("{cost}{BASELINE_BILL_SUFFIX}").as_str());
            select.push((base - col(cost.as_str())).fill_null(lit(0.0)).alias(name.as_str()));
        }
        Ok(joined.select(select))
    }

    /// Result columns one slice carries forward: keys, bill and metric
    /// inputs, and every column exported at `tier` directly or through its
    /// weighted form. Uncataloged columns pass so the tier downselect can
    /// report them.
    fn slice_inputs(
        &self,
        schema: &Schema,
        partitions: &[String],
        raw_bills: &[&str],
        tier: DataTier,
    ) -> PipelineResult<Vec<String>> {
        let registry = self.ctx.registry;
        let electricity_total = c::fuel_total_col(Fuel::Electricity);
        let mut keep = Vec::with_capacity(schema.len());
        for (name, dtype) in schema.iter() {
            let name = name.as_str();
            let needed = ALWAYS_KEEP.contains(&name)
                || partitions.iter().any(|p| p == name)
                || raw_bills.contains(&name)
                || name == c::FLR_AREA
                || name == electricity_total
                || match self.catalog.get(registry, name) {
                    None => true,
                    Some(def) if def.in_tier(tier) => true,
                    Some(_) if dtype.is_numeric() => match self.weighted_target(name)? {
                        Some((weighted, _, _)) => self
                            .catalog
                            .get(registry, &weighted)
                            .is_some_and(|d| d.in_tier(tier)),
                        None => false,
                    },
                    Some(_) => false,
                };
            if needed {
                keep.push(name.to_string());
            }
        }
        let dropped = schema.len() - keep.len();
        if dropped > 0 {
            log::debug!("{dropped} result column(s) outside the {} tier left out of the slice", tier.name());
        }
        Ok(keep)
    }

    /// Weighted name plus source and target units for a weightable column.
    fn weighted_target(&self, name: &str) -> PipelineResult<Option<(String, String, String)>> {
        if let Some(weighted) = self.savings_to_weighted.get(name) {
            let from = naming::units_from_col_name(name);
            let to = naming::units_from_col_name(weighted);
            return Ok(Some((weighted.clone(), from, to)));
        }
        if !is_weightable(name) {
            return Ok(None);
        }
        let from = naming::units_from_col_name(name);
        let Some(to) = self.ctx.weighted_units.target_for(&from) else {
            return Ok(None);
        };
        let weighted = naming::col_name_to_weighted(name, Some(to))?;
        let to = to.to_string();
        Ok(Some((weighted, from, to)))
    }

    fn weighted_exprs(&mut self, schema: &Schema) -> PipelineResult<Vec<Expr>> {
        let mut exprs = Vec::new();
        for (name, dtype) in schema.iter() {
            let name = name.as_str();
            if !dtype.is_numeric() {
                continue;
            }
            let Some((weighted, from, to)) = self.weighted_target(name)? else {
                continue;
            };
            let factor = conv_fact(&from, &to)?;
            exprs.push(
                (col(name).cast(DataType::Float64) * col(c::WEIGHT) * lit(factor)).alias(weighted.as_str()),
            );
            self.catalog.add_derived(
                self.ctx.registry,
                &weighted,
                ColumnDataType::Number,
                format!("{name} multiplied by the sample weight"),
                Some(name),
            );
        }
        Ok(exprs)
    }

    /// Bill intensity per floor area and electricity rate per kWh.
    fn bill_metric_exprs(&mut self, present: &[String]) -> PipelineResult<Vec<Expr>> {
        let has = |n: &str| present.iter().any(|p| p == n);
        let mut exprs = Vec::new();
        let Some(target) = self.ctx.weighted_units.target_for(c::BILL_UNITS) else {
            return Ok(exprs);
        };
        let factor = conv_fact(c::BILL_UNITS, target)?;

        let electricity_mean = c::bill_field_col("electricity", "mean", true);
        for bill in [electricity_mean.clone(), c::total_bill_col()] {
            let weighted = naming::col_name_to_weighted(&bill, Some(target))?;
            if !has(&weighted) || !has(c::FLR_AREA) {
                continue;
            }
            let name = naming::col_name_to_area_intensity(&bill)?;
            exprs.push(
                safe_divide(col(weighted.as_str()), col(c::FLR_AREA) * col(c::WEIGHT) * lit(factor))
                    .alias(name.as_str()),
            );
            self.catalog.add_derived(
                self.ctx.registry,
                &name,
                ColumnDataType::Number,
                format!("{bill} per unit floor area"),
                Some(&bill),
            );
        }

        let electricity_total = c::fuel_total_col(Fuel::Electricity);
        if has(&electricity_mean) && has(&electricity_total) {
            let name = naming::col_name_to_energy_rate(&electricity_mean)?;
            exprs.push(
                safe_divide(col(electricity_mean.as_str()), col(electricity_total.as_str())).alias(name.as_str()),
            );
            self.catalog.add_derived(
                self.ctx.registry,
                &name,
                ColumnDataType::Number,
                "Mean electricity bill per kWh consumed".into(),
                Some(&electricity_mean),
            );
        }
        Ok(exprs)
    }

    fn observe(&mut self, df: &DataFrame) -> PipelineResult<()> {
        let cap = self.ctx.registry.enumeration_threshold() + 1;
        for column in df.get_columns() {
            if column.dtype() != &DataType::String {
                continue;
            }
            let name = column.name().to_string();
            let seen = self.observed.entry(name.clone()).or_default();
            if seen.len() >= cap {
                continue;
            }
            for value in kernel::str_values(df, &name, "enumeration scan")?.into_iter().flatten() {
                seen.insert(value);
                if seen.len() >= cap {
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Write queueing ──────────────────────────────────────────────────────

    fn queue_slice(
        &mut self,
        slice: &DataFrame,
        entry: &ExportEntry,
        upgrade_id: UpgradeId,
        jobs: &mut Vec<WriteJob>,
    ) -> PipelineResult<()> {
        let partitions: Vec<String> = entry.partition_cols.iter().map(|p| p.column.clone()).collect();
        for (values, child) in child_partitions(slice, &partitions)? {
            for level in &entry.aggregation_levels {
                let (frame, suffix, keys) = match level {
                    AggregationLevel::Building => (
                        kernel::sort_frame(child.clone(), &[c::BUILDING_ID.to_string()])?,
                        String::new(),
                        partitions.clone(),
                    ),
                    AggregationLevel::Column(column) => {
                        let mut keys = partitions.clone();
                        if !keys.contains(column) {
                            keys.push(column.clone());
                        }
                        let frame = aggregate_frame(&child, &keys, &format!("export entry '{}'", entry.dir))?;
                        (frame, aggregation_suffix(entry, column), keys)
                    }
                    AggregationLevel::National => continue,
                };
                let aggregated = !matches!(level, AggregationLevel::Building);
                for tier in &entry.data_tiers {
                    let selected = self.downselect(&frame, *tier, &keys, aggregated)?;
                    for format in &entry.file_formats {
                        let dir = partition_dir(self.ctx.output_dir, entry, *tier, *format, &values);
                        let file = output_file_name(&values, upgrade_id, &suffix, *tier, *format);
                        jobs.push(WriteJob {
                            path:   dir.join(file),
                            format: *format,
                            frame:  selected.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn queue_national(
        &mut self,
        all: &DataFrame,
        entry: &ExportEntry,
        upgrade_id: UpgradeId,
        jobs: &mut Vec<WriteJob>,
    ) -> PipelineResult<()> {
        let frame = aggregate_frame(all, &[], &format!("export entry '{}' national", entry.dir))?;
        let prefix = [NATIONAL.to_string()];
        for tier in &entry.data_tiers {
            let selected = self.downselect(&frame, *tier, &[], true)?;
            for format in &entry.file_formats {
                let dir = partition_dir(self.ctx.output_dir, entry, *tier, *format, &[]);
                let file = output_file_name(&prefix, upgrade_id, AGG_SUFFIX, *tier, *format);
                jobs.push(WriteJob {
                    path:   dir.join(file),
                    format: *format,
                    frame:  selected.clone(),
                });
            }
        }
        Ok(())
    }

    /// Keep identity and key columns plus every cataloged column in `tier`.
    /// Uncataloged columns are warned about once and dropped.
    fn downselect(
        &mut self,
        frame: &DataFrame,
        tier: DataTier,
        keys: &[String],
        aggregated: bool,
    ) -> PipelineResult<DataFrame> {
        let names = frame_column_names(frame);
        let registry = self.ctx.registry;
        if registry.strict() {
            let requested: Vec<String> = registry
                .tier_columns(tier)
                .into_iter()
                .filter(|n| !aggregated || n.starts_with("calc.weighted."))
                .collect();
            registry.require_columns(&requested, &names, &format!("export tier {}", tier.name()))?;
        }

        let mut keep = Vec::with_capacity(names.len());
        for name in &names {
            if ALWAYS_KEEP.iter().any(|k| *k == name.as_str()) || keys.contains(name) {
                keep.push(name.clone());
                continue;
            }
            match self.catalog.get(registry, name) {
                Some(def) if def.in_tier(tier) => keep.push(name.clone()),
                Some(_) => {}
                None => {
                    if self.warned.insert(name.clone()) {
                        log::warn!("Column '{name}' is not in the column registry; dropped from export");
                    }
                }
            }
        }
        let ordered = kernel::canonical_order(&keep);
        self.exported.extend(ordered.iter().cloned());
        Ok(frame.select(ordered)?)
    }
}

// ── Frame helpers ───────────────────────────────────────────────────────────

fn is_weightable(name: &str) -> bool {
    name == c::FLR_AREA
        || ((name.starts_with("out.") || name.starts_with("calc."))
            && !name.starts_with("calc.weighted.")
            && !name.starts_with("calc.percent_savings."))
}

/// Distinct values of the first partition column, sorted. An entry with no
/// partitions has a single pass over everything.
fn level1_values(fkt: &LazyFrame, entry: &ExportEntry) -> PipelineResult<Vec<Option<String>>> {
    let Some(first) = entry.partition_cols.first() else {
        return Ok(vec![None]);
    };
    let df = kernel::materialize(
        fkt.clone()
            .select([col(first.column.as_str()).cast(DataType::String)])
            .group_by([col(first.column.as_str())])
            .agg(Vec::<Expr>::new()),
        &format!("export '{}' partition values", entry.dir),
    )?;
    let values: BTreeSet<String> = kernel::str_values(&df, &first.column, "partition values")?
        .into_iter()
        .flatten()
        .collect();
    Ok(values.into_iter().map(Some).collect())
}

/// Split a level-1 slice into one frame per combination of partition values.
fn child_partitions(df: &DataFrame, partitions: &[String]) -> PipelineResult<Vec<(Vec<String>, DataFrame)>> {
    if partitions.is_empty() {
        return Ok(vec![(Vec::new(), df.clone())]);
    }
    let mut columns = Vec::with_capacity(partitions.len());
    for p in partitions {
        columns.push(kernel::str_values(df, p, "child partitions")?);
    }
    let mut groups: BTreeMap<Vec<String>, Vec<IdxSize>> = BTreeMap::new();
    for row in 0..df.height() {
        let key: Vec<String> = columns
            .iter()
            .map(|values| values[row].clone().unwrap_or_else(|| NULL_PARTITION.to_string()))
            .collect();
        groups.entry(key).or_default().push(row as IdxSize);
    }
    let mut children = Vec::with_capacity(groups.len());
    for (key, rows) in groups {
        let idx = IdxCa::from_vec("row".into(), rows);
        children.push((key, df.take(&idx)?));
    }
    Ok(children)
}

/// Sum weights and weighted columns per (keys, upgrade), counting models.
pub fn aggregate_frame(df: &DataFrame, keys: &[String], context: &str) -> PipelineResult<DataFrame> {
    let names = frame_column_names(df);
    for key in keys {
        if !names.contains(key) {
            return Err(PipelineError::ColumnMissing {
                column:  key.clone(),
                context: format!("{context} aggregation"),
            });
        }
    }
    let mut group: Vec<String> = keys.to_vec();
    group.push(c::UPGRADE_ID.to_string());

    let mut aggs = Vec::new();
    for first in [c::UPGRADE_NAME, c::DATASET] {
        if names.iter().any(|n| n == first) {
            aggs.push(col(first).first());
        }
    }
    aggs.push(col(c::WEIGHT).sum());
    aggs.extend(
        names
            .iter()
            .filter(|n| n.starts_with("calc.weighted."))
            .map(|n| col(n.as_str()).sum()),
    );
    aggs.push(col(c::BUILDING_ID).n_unique().cast(DataType::Int64).alias(c::MODELS_USED));

    let group_exprs: Vec<Expr> = group.iter().map(|g| col(g.as_str())).collect();
    let lf = df.clone().lazy().group_by(group_exprs).agg(aggs);
    let out = kernel::materialize(lf, context)?;
    kernel::sort_frame(out, &group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_advances_linearly() {
        let mut pass = ExportPass::new(1, None);
        pass.advance(ExportPassState::ResolvedBills).unwrap();
        let err = pass.advance(ExportPassState::Weighted).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExportStateViolation { from: "ResolvedBills", to: "Weighted", .. }
        ));
        assert_eq!(pass.state(), ExportPassState::ResolvedBills);
    }

    #[test]
    fn file_names_carry_upgrade_and_suffixes() {
        let values = vec!["CO".to_string()];
        assert_eq!(
            output_file_name(&values, 0, "", DataTier::Full, FileFormat::Parquet),
            "CO_baseline.parquet"
        );
        assert_eq!(
            output_file_name(&values, 3, AGG_SUFFIX, DataTier::Basic, FileFormat::Csv),
            "CO_upgrade03_agg_basic.csv"
        );
    }
}
