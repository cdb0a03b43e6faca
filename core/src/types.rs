//! Shared primitive types used across the entire pipeline.

use serde::{Deserialize, Serialize};

/// Simulated building identifier (one per sampled building).
pub type BuildingId = i64;

/// Upgrade scenario identifier. 0 is the baseline.
pub type UpgradeId = i64;

/// The canonical run identifier.
pub type RunId = String;

pub const BASELINE_UPGRADE: UpgradeId = 0;

/// Export column-subset level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTier {
    Basic,
    Full,
    Detailed,
}

impl DataTier {
    pub const ALL: [DataTier; 3] = [DataTier::Basic, DataTier::Full, DataTier::Detailed];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Basic    => "basic",
            Self::Full     => "full",
            Self::Detailed => "detailed",
        }
    }
}

/// Output file format for exported partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Parquet,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv     => "csv",
            Self::Parquet => "parquet",
        }
    }
}

/// Where a column comes from, as declared by the column-definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOrigin {
    SimulationOutput,
    SampleCovariate,
    GeographyJoin,
    EnvironmentalJusticeJoin,
    Derived,
}

impl ColumnOrigin {
    /// Parse the `location` field of the column-definition table.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simulation_output" | "simulation-output" | "results" => Some(Self::SimulationOutput),
            "sample_covariate" | "sample-covariate" | "buildstock" => Some(Self::SampleCovariate),
            "geography_join" | "geography-join" | "geospatial" => Some(Self::GeographyJoin),
            "environmental_justice_join" | "environmental-justice-join" | "ejscreen" => {
                Some(Self::EnvironmentalJusticeJoin)
            }
            "derived" | "calculated" => Some(Self::Derived),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SimulationOutput         => "simulation_output",
            Self::SampleCovariate          => "sample_covariate",
            Self::GeographyJoin            => "geography_join",
            Self::EnvironmentalJusticeJoin => "environmental_justice_join",
            Self::Derived                  => "derived",
        }
    }
}

/// Declared data type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDataType {
    String,
    Number,
    Boolean,
}

impl ColumnDataType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Some(Self::String),
            "number" | "float" | "double" | "integer" | "int" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String  => "string",
            Self::Number  => "number",
            Self::Boolean => "boolean",
        }
    }
}

/// Geography key a frame can be enriched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoKey {
    Tract,
    County,
    Puma,
    State,
}
