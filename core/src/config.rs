use crate::types::{DataTier, FileFormat, UpgradeId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const WORKERS_ENV:              &str = "STOCKPOST_WORKERS";
pub const OBJECT_STORE_PROFILE_ENV: &str = "STOCKPOST_OBJECT_STORE_PROFILE";

pub const DEFAULT_WORKERS: usize = 12;

// ── Inputs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPaths {
    /// Directory holding `results_up<NN>.parquet`.
    pub results_dir: PathBuf,
    pub buildstock: PathBuf,
    pub column_definitions: PathBuf,
    pub enumeration_definitions: PathBuf,
    #[serde(default)]
    pub truth_inventory: Option<PathBuf>,
    #[serde(default)]
    pub geography_lookup: Option<PathBuf>,
    #[serde(default)]
    pub environmental_justice: Option<PathBuf>,
    #[serde(default)]
    pub tract_utilities: Option<PathBuf>,
    /// Reference-survey weighted floor area per building type.
    #[serde(default)]
    pub reference_floor_area: Option<PathBuf>,
}

// ── Stage settings ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub acceptable_failure_fraction:    f64,
    pub drop_failed_baseline_buildings: bool,
    pub reload_from_cache:              bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            acceptable_failure_fraction:    0.01,
            drop_failed_baseline_buildings: true,
            reload_from_cache:              false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApportionmentConfig {
    pub enabled:            bool,
    pub drop_micro_schools: bool,
    /// Reuse the persisted FKT for this seed instead of redrawing.
    pub reload_from_cache:  bool,
}

impl Default for ApportionmentConfig {
    fn default() -> Self {
        Self {
            enabled:            true,
            drop_micro_schools: true,
            reload_from_cache:  true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RescaleConfig {
    pub enabled:             bool,
    /// Expected factor range after apportionment.
    pub apportioned_window:   [f64; 2],
    /// Expected factor range when weights come straight from the sample.
    pub unapportioned_window: [f64; 2],
}

impl Default for RescaleConfig {
    fn default() -> Self {
        Self {
            enabled:              true,
            apportioned_window:   [0.6, 1.3],
            unapportioned_window: [1.0, 15.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnsConfig {
    /// Fail when a requested export column is absent from the data.
    pub strict:                bool,
    /// Distinct-value count at or below which enumerations are listed.
    pub enumeration_threshold: usize,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            strict:                false,
            enumeration_threshold: 10,
        }
    }
}

/// Target units for weighted columns, keyed by the source column's units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedUnits {
    pub energy:    String,
    pub demand:    String,
    pub emissions: String,
    pub cost:      String,
    pub area:      String,
}

impl Default for WeightedUnits {
    fn default() -> Self {
        Self {
            energy:    "tbtu".into(),
            demand:    "gw".into(),
            emissions: "co2e_mmt".into(),
            cost:      "billion_usd".into(),
            area:      "ft2".into(),
        }
    }
}

impl WeightedUnits {
    pub fn target_for(&self, source_units: &str) -> Option<&str> {
        match source_units {
            "kwh"                   => Some(self.energy.as_str()),
            "kw"                    => Some(self.demand.as_str()),
            "co2e_kg" | "co2e_mmt"  => Some(self.emissions.as_str()),
            "usd"                   => Some(self.cost.as_str()),
            "ft2"                   => Some(self.area.as_str()),
            _                       => None,
        }
    }
}

// ── Export plan ─────────────────────────────────────────────────────────────

/// One aggregation level of an export entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum AggregationLevel {
    /// One row per building.
    Building,
    /// Sum over buildings sharing the column's value.
    Column(String),
    /// Sum over everything in the upgrade.
    National,
}

impl From<Option<String>> for AggregationLevel {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref() {
            None => Self::Building,
            Some("national") => Self::National,
            Some(column) => Self::Column(column.to_string()),
        }
    }
}

impl From<AggregationLevel> for Option<String> {
    fn from(level: AggregationLevel) -> Self {
        match level {
            AggregationLevel::Building => None,
            AggregationLevel::National => Some("national".into()),
            AggregationLevel::Column(column) => Some(column),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionColumn {
    pub column: String,
    /// Directory label written as `<label>=<value>`.
    pub label:  String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub dir: String,
    /// Ordered outermost first; the first column is the level-1 partition.
    #[serde(default)]
    pub partition_cols: Vec<PartitionColumn>,
    pub aggregation_levels: Vec<AggregationLevel>,
    pub data_tiers: Vec<DataTier>,
    pub file_formats: Vec<FileFormat>,
}

impl ExportEntry {
    /// The widest tier requested by this entry.
    pub fn widest_tier(&self) -> Option<DataTier> {
        self.data_tiers.iter().copied().max()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportPlan {
    pub entries: Vec<ExportEntry>,
}

impl ExportPlan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub plan:                 ExportPlan,
    pub workers:              usize,
    pub object_store_profile: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            plan:                 ExportPlan::default(),
            workers:              DEFAULT_WORKERS,
            object_store_profile: None,
        }
    }
}

// ── Pipeline config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Written to the `dataset` column of every row.
    pub dataset:     String,
    pub seed:        u64,
    pub upgrade_ids: Vec<UpgradeId>,
    pub inputs:      InputPaths,
    pub output_dir:  PathBuf,
    #[serde(default)]
    pub ingest:         IngestConfig,
    #[serde(default)]
    pub apportionment:  ApportionmentConfig,
    #[serde(default)]
    pub rescale:        RescaleConfig,
    #[serde(default)]
    pub columns:        ColumnsConfig,
    #[serde(default)]
    pub export:         ExportConfig,
    #[serde(default)]
    pub weighted_units: WeightedUnits,
}

impl PipelineConfig {
    /// Load from a JSON file, then apply environment overrides.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        let mut config: PipelineConfig = serde_json::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply the worker-count and object-store overrides from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(WORKERS_ENV) {
            let workers: usize = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{WORKERS_ENV}={raw} is not a worker count: {e}"))?;
            if workers == 0 {
                anyhow::bail!("{WORKERS_ENV} must be at least 1");
            }
            self.export.workers = workers;
        }
        if let Some(profile) = lookup(OBJECT_STORE_PROFILE_ENV) {
            self.export.object_store_profile = Some(profile);
        }
        Ok(())
    }

    pub fn buildstock_path(&self) -> &Path {
        &self.inputs.buildstock
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.output_dir.join("diagnostics")
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        let root = std::env::temp_dir().join("stockpost-test");
        Self {
            dataset:     "stockpost test".into(),
            seed:        42,
            upgrade_ids: vec![0, 1],
            inputs: InputPaths {
                results_dir:             root.join("results"),
                buildstock:              root.join("buildstock.csv"),
                column_definitions:      root.join("column_definitions.csv"),
                enumeration_definitions: root.join("enumeration_definitions.csv"),
                truth_inventory:         None,
                geography_lookup:        None,
                environmental_justice:   None,
                tract_utilities:         None,
                reference_floor_area:    None,
            },
            output_dir:     root.join("output"),
            ingest:         IngestConfig::default(),
            apportionment:  ApportionmentConfig {
                enabled:            false,
                drop_micro_schools: true,
                reload_from_cache:  false,
            },
            rescale:        RescaleConfig {
                enabled: false,
                ..RescaleConfig::default()
            },
            columns:        ColumnsConfig::default(),
            export:         ExportConfig {
                workers: 2,
                ..ExportConfig::default()
            },
            weighted_units: WeightedUnits::default(),
        }
    }
}
