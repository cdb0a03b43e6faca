use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Missing required input: {path}")]
    MissingRequiredInput { path: String },

    #[error("Schema conflict on column '{column}' for upgrade {upgrade_id}: {left} vs {right}")]
    SchemaConflict {
        column:     String,
        upgrade_id: i64,
        left:       String,
        right:      String,
    },

    #[error("Upgrade {upgrade_id} ({upgrade_name}) failure fraction {fraction:.4} exceeds {threshold:.4}")]
    UpgradeFailureRateExceeded {
        upgrade_id:   i64,
        upgrade_name: String,
        fraction:     f64,
        threshold:    f64,
    },

    #[error("Segment classification left {rows} row(s) at ERROR (first building_id: {first_building_id:?})")]
    SegmentClassificationGap {
        rows:              usize,
        first_building_id: Option<i64>,
    },

    #[error("Sampling dependency order cannot be resolved: {detail}")]
    DependencyOrderUnresolvable { detail: String },

    #[error("Column '{column}' missing ({context})")]
    ColumnMissing { column: String, context: String },

    #[error("No utility bundle for building {building_id} in column '{column}' (utility '{utility}', state '{state}')")]
    UtilityBundleMissing {
        building_id: i64,
        column:      String,
        utility:     String,
        state:       String,
    },

    #[error("No naming rule applies to column '{name}' ({rule})")]
    InvalidColumnName { name: String, rule: &'static str },

    #[error("No unit conversion from '{from}' to '{to}'")]
    UnknownUnitConversion { from: String, to: String },

    #[error("Invalid scaling factor for building type '{building_type}': {factor}")]
    InvalidScalingFactor { building_type: String, factor: f64 },

    #[error("Export pass for upgrade {upgrade_id} cannot move from {from} to {to}")]
    ExportStateViolation {
        upgrade_id: i64,
        from:       &'static str,
        to:         &'static str,
    },

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable identifier for every error the pipeline can surface.
/// Exit codes are part of the runner's contract: append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingRequiredInput,
    SchemaConflict,
    UpgradeFailureRateExceeded,
    SegmentClassificationGap,
    DependencyOrderUnresolvable,
    ColumnMissing,
    UtilityBundleMissing,
    InvalidColumnName,
    UnknownUnitConversion,
    InvalidScalingFactor,
    ExportStateViolation,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MissingRequiredInput        => "MissingRequiredInput",
            Self::SchemaConflict              => "SchemaConflict",
            Self::UpgradeFailureRateExceeded  => "UpgradeFailureRateExceeded",
            Self::SegmentClassificationGap    => "SegmentClassificationGap",
            Self::DependencyOrderUnresolvable => "DependencyOrderUnresolvable",
            Self::ColumnMissing               => "ColumnMissing",
            Self::UtilityBundleMissing        => "UtilityBundleMissing",
            Self::InvalidColumnName           => "InvalidColumnName",
            Self::UnknownUnitConversion       => "UnknownUnitConversion",
            Self::InvalidScalingFactor        => "InvalidScalingFactor",
            Self::ExportStateViolation        => "ExportStateViolation",
            Self::Internal                    => "Internal",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingRequiredInput        => 10,
            Self::SchemaConflict              => 11,
            Self::UpgradeFailureRateExceeded  => 12,
            Self::SegmentClassificationGap    => 13,
            Self::DependencyOrderUnresolvable => 14,
            Self::ColumnMissing               => 15,
            Self::UtilityBundleMissing        => 16,
            Self::InvalidColumnName           => 17,
            Self::UnknownUnitConversion       => 18,
            Self::InvalidScalingFactor        => 19,
            Self::ExportStateViolation        => 20,
            Self::Internal                    => 1,
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRequiredInput { .. }        => ErrorKind::MissingRequiredInput,
            Self::SchemaConflict { .. }              => ErrorKind::SchemaConflict,
            Self::UpgradeFailureRateExceeded { .. }  => ErrorKind::UpgradeFailureRateExceeded,
            Self::SegmentClassificationGap { .. }    => ErrorKind::SegmentClassificationGap,
            Self::DependencyOrderUnresolvable { .. } => ErrorKind::DependencyOrderUnresolvable,
            Self::ColumnMissing { .. }               => ErrorKind::ColumnMissing,
            Self::UtilityBundleMissing { .. }        => ErrorKind::UtilityBundleMissing,
            Self::InvalidColumnName { .. }           => ErrorKind::InvalidColumnName,
            Self::UnknownUnitConversion { .. }       => ErrorKind::UnknownUnitConversion,
            Self::InvalidScalingFactor { .. }        => ErrorKind::InvalidScalingFactor,
            Self::ExportStateViolation { .. }        => ErrorKind::ExportStateViolation,
            Self::Polars(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Csv(_)
            | Self::Io(_)
            | Self::Other(_)                         => ErrorKind::Internal,
        }
    }

    pub fn missing_input(path: impl AsRef<std::path::Path>) -> Self {
        Self::MissingRequiredInput {
            path: path.as_ref().display().to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
