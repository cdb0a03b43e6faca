//! The pipeline engine: wires stage outputs to stage inputs.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Apportioner      (truth inventory → FKT, or the sample FKT)
//!   2. CbecsRescaler    (FKT weights → reference floor area)
//!   3. ResultsIngest    (per-upgrade results → cached wide frames)
//!   4. DerivationEngine (canonical names, derived and savings columns)
//!   5. ExportPlanner    (bills, geography, weighting, partitioned files)
//!   6. Data dictionaries
//!
//! RULES:
//!   - Stages are functions over lazy frames. The engine only wires them.
//!   - All randomness flows through the RngBank.
//!   - Every diagnostic is logged and appended to the run ledger.

use crate::{
    apportionment_stage::{self, ApportionmentSettings, BucketShortfall},
    column_registry::ColumnRegistry,
    config::PipelineConfig,
    derivation_stage,
    dictionary,
    error::{PipelineError, PipelineResult},
    event::PipelineEvent,
    export_stage::{ExportContext, Exporter},
    geo_stage::GeographyTables,
    ingest_stage::{self, FailureSummary, IngestSettings},
    kernel,
    rescale_stage::{self, ScalingFactor},
    rng::{RngBank, StageSlot},
    store::{self, RunLedger},
    types::{BuildingId, RunId},
    utility_bill_stage,
};
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const FAILURE_SUMMARY_FILE: &str = "failure_summary_aggregated.csv";
pub const SHORTFALL_FILE:       &str = "apportionment_shortfall.csv";
pub const RESCALE_FILE:         &str = "rescale_factors.csv";

/// What a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id:            RunId,
    pub files:             Vec<PathBuf>,
    pub failure_summaries: Vec<FailureSummary>,
    pub shortfalls:        Vec<BucketShortfall>,
    pub scaling_factors:   Vec<ScalingFactor>,
    pub dictionaries:      Vec<PathBuf>,
}

#[derive(Serialize)]
struct FailureSummaryRow<'a> {
    upgrade_id:                      i64,
    upgrade_name:                    &'a str,
    total:                           usize,
    success:                         usize,
    not_applicable:                  usize,
    fail:                            usize,
    fraction_fail:                   f64,
    fraction_not_applicable:         f64,
    fraction_applicable:             f64,
    success_in_base_fail_in_upgrade: usize,
    success_in_upgrade_fail_in_base: usize,
    failure_modes:                   String,
}

pub struct PipelineEngine {
    pub run_id:   RunId,
    pub rng_bank: RngBank,
    config:       PipelineConfig,
    registry:     ColumnRegistry,
    ledger:       RunLedger,
}

impl PipelineEngine {
    pub fn new(run_id: RunId, config: PipelineConfig, registry: ColumnRegistry, ledger: RunLedger) -> Self {
        Self {
            rng_bank: RngBank::new(config.seed),
            run_id,
            config,
            registry,
            ledger,
        }
    }

    /// Load the registry named by the config and build an engine with a
    /// fresh run id. Call this instead of new() outside tests.
    pub fn build(config: PipelineConfig, ledger: RunLedger) -> PipelineResult<Self> {
        let registry = ColumnRegistry::load(
            &config.inputs.column_definitions,
            &config.inputs.enumeration_definitions,
            config.columns.strict,
            config.columns.enumeration_threshold,
        )?;
        Ok(Self::new(store::new_run_id(), config, registry, ledger))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Run every stage in order.
    pub fn run(&mut self) -> PipelineResult<RunSummary> {
        self.ledger.insert_run(
            &self.run_id,
            self.config.seed,
            &self.config.dataset,
            env!("CARGO_PKG_VERSION"),
        )?;
        self.emit("engine", PipelineEvent::RunInitialized {
            run_id:  self.run_id.clone(),
            seed:    self.config.seed,
            dataset: self.config.dataset.clone(),
        })?;
        log::info!("Run {} started (seed {})", self.run_id, self.config.seed);

        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            ..RunSummary::default()
        };

        let covariates = ingest_stage::load_covariates(self.config.buildstock_path(), &self.registry)?;

        // 1. Apportioner
        self.stage_started("apportionment")?;
        let excluded = self.baseline_failures(&covariates)?;
        let pool = kernel::exclude_buildings(covariates.clone(), &excluded)?;
        let (fkt, shortfalls) = self.apportion(pool, &excluded)?;
        summary.shortfalls = shortfalls;
        self.stage_completed("apportionment")?;

        // 2. CbecsRescaler
        self.stage_started("rescale")?;
        let (fkt, factors) = self.rescale(fkt, &covariates)?;
        summary.scaling_factors = factors;
        self.stage_completed("rescale")?;

        // 3. ResultsIngest
        self.stage_started("ingest")?;
        let (results, summaries) = self.ingest(&covariates)?;
        summary.failure_summaries = summaries;
        self.stage_completed("ingest")?;

        // 4. DerivationEngine
        self.stage_started("derivation")?;
        let derived = derivation_stage::derive(results, &self.registry, &self.config.weighted_units)?;
        self.stage_completed("derivation")?;

        // 5. ExportPlanner
        self.stage_started("export")?;
        let geography = match &self.config.inputs.geography_lookup {
            Some(path) => Some(GeographyTables::load(
                path,
                self.config.inputs.environmental_justice.as_deref(),
            )?),
            None => None,
        };
        let tract_utilities = match &self.config.inputs.tract_utilities {
            Some(path) => Some(utility_bill_stage::load_tract_utilities(path)?),
            None => None,
        };
        let ctx = ExportContext {
            registry:             &self.registry,
            weighted_units:       &self.config.weighted_units,
            geography:            geography.as_ref(),
            tract_utilities:      tract_utilities.as_ref(),
            output_dir:           &self.config.output_dir,
            workers:              self.config.export.workers,
            object_store_profile: self.config.export.object_store_profile.as_deref(),
        };
        let mut exporter = Exporter::new(ctx, &derived.derived, &derived.savings_to_weighted);
        exporter.run(&derived.frame, &fkt, &self.config.upgrade_ids, &self.config.export.plan)?;
        let report = exporter.finish();
        for path in &report.files {
            self.emit("export", PipelineEvent::ExportFileWritten {
                path: path.display().to_string(),
            })?;
        }
        self.stage_completed("export")?;

        // 6. Data dictionaries
        let (data, enumerations) =
            dictionary::write_dictionaries(&self.config.output_dir, &self.registry, &report)?;
        for path in [&data, &enumerations] {
            self.emit("dictionary", PipelineEvent::DictionaryWritten {
                path: path.display().to_string(),
            })?;
        }
        summary.files = report.files;
        summary.dictionaries = vec![data, enumerations];

        log::info!(
            "Run {} complete: {} export file(s)",
            self.run_id,
            summary.files.len()
        );
        Ok(summary)
    }

    // ── Stages ─────────────────────────────────────────────────

    /// Buildings that failed in the baseline, when they are to be dropped.
    /// They leave the simulated pool before any weight is drawn for them.
    fn baseline_failures(&self, covariates: &LazyFrame) -> PipelineResult<BTreeSet<BuildingId>> {
        if !self.config.ingest.drop_failed_baseline_buildings {
            return Ok(BTreeSet::new());
        }
        let failed = ingest_stage::failed_baseline_buildings(
            &self.config.inputs.results_dir,
            covariates,
            &self.config.dataset,
        )?;
        if !failed.is_empty() {
            log::warn!(
                "{} building(s) failed in the baseline; excluded from the simulated pool",
                failed.len()
            );
            self.emit("apportionment", PipelineEvent::BaselineFailuresExcluded {
                buildings: failed.len() as u64,
            })?;
        }
        Ok(failed)
    }

    fn apportion(
        &self,
        covariates: LazyFrame,
        excluded: &BTreeSet<BuildingId>,
    ) -> PipelineResult<(LazyFrame, Vec<BucketShortfall>)> {
        if !self.config.apportionment.enabled {
            log::info!("Apportionment disabled; FKT taken from the sample");
            return Ok((apportionment_stage::fkt_from_sample(covariates)?, Vec::new()));
        }
        let truth_path = self
            .config
            .inputs
            .truth_inventory
            .clone()
            .ok_or_else(|| PipelineError::missing_input("truth inventory (apportionment enabled)"))?;
        let truth = kernel::read_csv(&truth_path)?.lazy();
        let settings = ApportionmentSettings {
            seed:               self.config.seed,
            drop_micro_schools: self.config.apportionment.drop_micro_schools,
            reload_from_cache:  self.config.apportionment.reload_from_cache,
            input_digest:       self.apportionment_digest(&truth_path, excluded)?,
        };
        let mut rng = self.rng_bank.for_stage(StageSlot::Apportionment);
        let output = apportionment_stage::apportion(
            covariates,
            truth,
            &settings,
            &self.config.output_dir,
            &mut rng,
        )?;
        self.emit("apportionment", PipelineEvent::CheckpointMaterialized {
            stage: "apportionment".into(),
            path:  output.cache_path.display().to_string(),
        })?;

        if !output.reloaded {
            let path = self.config.diagnostics_dir().join(SHORTFALL_FILE);
            apportionment_stage::write_shortfall_report(&path, &output.shortfalls)?;
            for shortfall in &output.shortfalls {
                self.ledger.record_shortfall(&self.run_id, shortfall)?;
                self.emit("apportionment", PipelineEvent::ApportionmentShortfall {
                    bucket:     shortfall.bucket.clone(),
                    truth_rows: shortfall.truth_rows as u64,
                    truth_sqft: shortfall.truth_sqft,
                })?;
            }
            if output.micro_schools_dropped > 0 {
                log::info!("{} micro-school truth row(s) dropped", output.micro_schools_dropped);
            }
        }
        Ok((output.fkt, output.shortfalls))
    }

    /// Digest of the truth inventory, the sample, the excluded buildings and
    /// the micro-school switch.
    fn apportionment_digest(&self, truth_path: &Path, excluded: &BTreeSet<BuildingId>) -> PipelineResult<String> {
        let truth = std::fs::read(truth_path)?;
        let sample = std::fs::read(self.config.buildstock_path())?;
        let excluded: Vec<u8> = excluded.iter().flat_map(|id| id.to_le_bytes()).collect();
        let micro = [u8::from(self.config.apportionment.drop_micro_schools)];
        Ok(kernel::input_digest([
            ("truth", truth.as_slice()),
            ("sample", sample.as_slice()),
            ("excluded", excluded.as_slice()),
            ("drop_micro_schools", micro.as_slice()),
        ]))
    }

    fn rescale(
        &self,
        fkt: LazyFrame,
        covariates: &LazyFrame,
    ) -> PipelineResult<(LazyFrame, Vec<ScalingFactor>)> {
        if !self.config.rescale.enabled {
            return Ok((fkt, Vec::new()));
        }
        let path = self
            .config
            .inputs
            .reference_floor_area
            .clone()
            .ok_or_else(|| PipelineError::missing_input("reference floor area (rescale enabled)"))?;
        let reference = rescale_stage::load_reference(&path)?;
        let window = if self.config.apportionment.enabled {
            self.config.rescale.apportioned_window
        } else {
            self.config.rescale.unapportioned_window
        };
        let (fkt, factors) = rescale_stage::rescale(fkt, covariates, &reference, window)?;
        rescale_stage::write_factor_report(&self.config.diagnostics_dir().join(RESCALE_FILE), &factors)?;
        for factor in &factors {
            self.emit("rescale", PipelineEvent::RescaleFactor {
                building_type: factor.building_type.clone(),
                factor:        factor.factor,
                in_window:     factor.in_window,
            })?;
        }
        Ok((fkt, factors))
    }

    fn ingest(&self, covariates: &LazyFrame) -> PipelineResult<(LazyFrame, Vec<FailureSummary>)> {
        let output_dir = self.config.output_dir.clone();
        if self.config.ingest.reload_from_cache {
            if let Some(frame) = ingest_stage::reload_cached(&output_dir, &self.config.upgrade_ids)? {
                return Ok((frame, Vec::new()));
            }
            log::info!("Ingest cache incomplete; ingesting from results");
        }
        let raw = ingest_stage::load_results(&self.config.inputs.results_dir, &self.config.upgrade_ids)?;
        let settings = IngestSettings {
            dataset:                        self.config.dataset.clone(),
            acceptable_failure_fraction:    self.config.ingest.acceptable_failure_fraction,
            drop_failed_baseline_buildings: self.config.ingest.drop_failed_baseline_buildings,
        };
        let output = ingest_stage::ingest_results(raw, covariates, &settings, &output_dir)?;

        write_failure_summaries(&output_dir.join(FAILURE_SUMMARY_FILE), &output.summaries)?;
        for s in &output.summaries {
            self.ledger.record_failure_summary(&self.run_id, s)?;
            self.emit("ingest", PipelineEvent::FailureSummaryRecorded {
                upgrade_id:       s.upgrade_id,
                total:            s.total as u64,
                failed:           s.fail as u64,
                failure_fraction: s.fraction_fail,
            })?;
        }
        Ok((output.frame, output.summaries))
    }

    // ── Ledger helpers ─────────────────────────────────────────

    fn emit(&self, stage: &str, event: PipelineEvent) -> PipelineResult<()> {
        self.ledger.record(&self.run_id, stage, &event)
    }

    fn stage_started(&self, stage: &str) -> PipelineResult<()> {
        log::info!("Stage {stage} started");
        self.emit(stage, PipelineEvent::StageStarted { stage: stage.into() })
    }

    fn stage_completed(&self, stage: &str) -> PipelineResult<()> {
        log::info!("Stage {stage} completed");
        self.emit(stage, PipelineEvent::StageCompleted { stage: stage.into() })
    }
}

/// `<output_dir>/failure_summary_aggregated.csv`
pub fn write_failure_summaries(path: &Path, summaries: &[FailureSummary]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for s in summaries {
        writer.serialize(FailureSummaryRow {
            upgrade_id:                      s.upgrade_id,
            upgrade_name:                    &s.upgrade_name,
            total:                           s.total,
            success:                         s.success,
            not_applicable:                  s.not_applicable,
            fail:                            s.fail,
            fraction_fail:                   s.fraction_fail,
            fraction_not_applicable:         s.fraction_not_applicable,
            fraction_applicable:             s.fraction_applicable,
            success_in_base_fail_in_upgrade: s.success_in_base_fail_in_upgrade,
            success_in_upgrade_fail_in_base: s.success_in_upgrade_fail_in_base,
            failure_modes:                   serde_json::to_string(&s.failure_modes)?,
        })?;
    }
    writer.flush()?;
    Ok(())
}
