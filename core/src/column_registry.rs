//! The column registry: column definitions and enumeration descriptions.
//!
//! RULE: The registry is loaded once and is read-only afterwards.
//! Columns created by the pipeline are described by derived
//! ColumnDefinitions that live in the export catalog, never here.

use crate::{
    error::{PipelineError, PipelineResult},
    naming,
    types::{ColumnDataType, ColumnOrigin, DataTier},
    units::conv_fact,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

pub const TOO_MANY_TO_LIST: &str = "…too many to list";

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub origin:         ColumnOrigin,
    pub original_name:  String,
    pub new_name:       String,
    pub original_units: Option<String>,
    pub new_units:      Option<String>,
    pub data_type:      ColumnDataType,
    pub description:    String,
    pub basic:          bool,
    pub full:           bool,
    pub detailed:       bool,
}

impl ColumnDefinition {
    /// `<new_name>..<new_units>`, or the bare new name for unitless columns.
    pub fn new_name_with_units(&self) -> String {
        naming::with_units(&self.new_name, self.new_units.as_deref())
    }

    pub fn units(&self) -> Option<&str> {
        self.new_units.as_deref().or(self.original_units.as_deref())
    }

    pub fn in_tier(&self, tier: DataTier) -> bool {
        match tier {
            DataTier::Basic    => self.basic,
            DataTier::Full     => self.full,
            DataTier::Detailed => self.detailed,
        }
    }

    /// Factor applied to raw values on rename. Non-numeric columns never convert.
    pub fn conversion_factor(&self) -> PipelineResult<f64> {
        match (self.data_type, &self.original_units, &self.new_units) {
            (ColumnDataType::Number, Some(from), Some(to)) => conv_fact(from, to),
            _ => Ok(1.0),
        }
    }

    /// Describe a column created by the pipeline. Tiers are inherited from
    /// `source` when the source column is known, otherwise full + detailed.
    pub fn derived(
        name: &str,
        data_type: ColumnDataType,
        description: impl Into<String>,
        source: Option<&ColumnDefinition>,
    ) -> Self {
        let units = naming::units_from_col_name(name);
        let units = if units.is_empty() { None } else { Some(units) };
        let (basic, full, detailed) = source
            .map(|s| (s.basic, s.full, s.detailed))
            .unwrap_or((false, true, true));
        Self {
            origin:         ColumnOrigin::Derived,
            original_name:  name.to_string(),
            new_name:       naming::strip_units(name).to_string(),
            original_units: units.clone(),
            new_units:      units,
            data_type,
            description:    description.into(),
            basic,
            full,
            detailed,
        }
    }
}

/// One step of the rename plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RenameStep {
    pub original: String,
    pub renamed:  String,
    pub factor:   f64,
}

/// Allowable enumerations for one column, as listed in the data dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum AllowableEnumerations {
    NotEnumerated,
    Listed(Vec<String>),
    TooMany,
}

impl AllowableEnumerations {
    pub fn render(&self) -> String {
        match self {
            Self::NotEnumerated => String::new(),
            Self::Listed(values) => values.join("|"),
            Self::TooMany => TOO_MANY_TO_LIST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescription {
    pub description:  String,
    pub enumerations: AllowableEnumerations,
}

// ── CSV rows ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ColumnDefinitionRow {
    location:          String,
    original_col_name: String,
    original_units:    Option<String>,
    new_col_name:      String,
    new_units:         Option<String>,
    data_type:         String,
    field_description: Option<String>,
    basic_metadata:    Option<String>,
    full_metadata:     Option<String>,
    detailed_metadata: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnumerationRow {
    enumeration:             String,
    enumeration_description: Option<String>,
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "y" | "x")
    )
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ColumnDefinitionRow {
    fn into_definition(self) -> PipelineResult<ColumnDefinition> {
        let origin = ColumnOrigin::parse(&self.location).ok_or_else(|| {
            PipelineError::Other(anyhow::anyhow!(
                "Unknown column location '{}' for '{}'",
                self.location,
                self.original_col_name
            ))
        })?;
        let data_type = ColumnDataType::parse(&self.data_type).ok_or_else(|| {
            PipelineError::Other(anyhow::anyhow!(
                "Unknown data type '{}' for '{}'",
                self.data_type,
                self.original_col_name
            ))
        })?;
        let original_units = non_empty(self.original_units);
        // A column with no target units keeps its source units.
        let new_units = non_empty(self.new_units).or_else(|| original_units.clone());
        Ok(ColumnDefinition {
            origin,
            original_name: self.original_col_name.trim().to_string(),
            new_name: self.new_col_name.trim().to_string(),
            original_units,
            new_units,
            data_type,
            description: non_empty(self.field_description).unwrap_or_default(),
            basic: parse_flag(self.basic_metadata.as_deref()),
            full: parse_flag(self.full_metadata.as_deref()),
            detailed: parse_flag(self.detailed_metadata.as_deref()),
        })
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ColumnRegistry {
    definitions:           Vec<ColumnDefinition>,
    by_name:               HashMap<String, usize>,
    enumerations:          BTreeMap<String, String>,
    strict:                bool,
    enumeration_threshold: usize,
}

impl ColumnRegistry {
    /// Load both tables from CSV.
    pub fn load(
        column_definitions: &Path,
        enumeration_definitions: &Path,
        strict: bool,
        enumeration_threshold: usize,
    ) -> PipelineResult<Self> {
        if !column_definitions.exists() {
            return Err(PipelineError::missing_input(column_definitions));
        }
        let mut reader = csv::Reader::from_path(column_definitions)?;
        let mut definitions = Vec::new();
        for row in reader.deserialize::<ColumnDefinitionRow>() {
            definitions.push(row?.into_definition()?);
        }

        let mut enumerations = BTreeMap::new();
        if enumeration_definitions.exists() {
            let mut reader = csv::Reader::from_path(enumeration_definitions)?;
            for row in reader.deserialize::<EnumerationRow>() {
                let row = row?;
                enumerations.insert(
                    row.enumeration.trim().to_string(),
                    row.enumeration_description.unwrap_or_default(),
                );
            }
        } else {
            log::warn!(
                "No enumeration definitions at {}; dictionary enumerations will be undescribed",
                enumeration_definitions.display()
            );
        }

        log::info!(
            "Column registry loaded: {} definitions, {} enumerations",
            definitions.len(),
            enumerations.len()
        );
        Self::from_definitions(definitions, enumerations, strict, enumeration_threshold)
    }

    /// Build a registry from in-memory tables. Canonical names must be unique.
    pub fn from_definitions(
        definitions: Vec<ColumnDefinition>,
        enumerations: BTreeMap<String, String>,
        strict: bool,
        enumeration_threshold: usize,
    ) -> PipelineResult<Self> {
        let mut by_name = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            if by_name.insert(def.new_name_with_units(), idx).is_some() {
                return Err(PipelineError::InvalidColumnName {
                    name: def.new_name_with_units(),
                    rule: "registry (duplicate canonical name)",
                });
            }
        }
        Ok(Self {
            definitions,
            by_name,
            enumerations,
            strict,
            enumeration_threshold,
        })
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn enumeration_threshold(&self) -> usize {
        self.enumeration_threshold
    }

    pub fn definitions(&self) -> &[ColumnDefinition] {
        &self.definitions
    }

    /// Look up a definition by canonical name (with units).
    pub fn get(&self, name: &str) -> Option<&ColumnDefinition> {
        self.by_name.get(name).map(|idx| &self.definitions[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Raw column names of a given origin kept at the detailed tier.
    pub fn raw_columns_to_keep(&self, origin: ColumnOrigin) -> Vec<&str> {
        self.definitions
            .iter()
            .filter(|d| d.origin == origin && d.detailed)
            .map(|d| d.original_name.as_str())
            .collect()
    }

    /// (original name, canonical name with units, conversion factor) for
    /// every registered column.
    pub fn rename_plan(&self) -> PipelineResult<Vec<RenameStep>> {
        self.definitions
            .iter()
            .map(|d| {
                Ok(RenameStep {
                    original: d.original_name.clone(),
                    renamed:  d.new_name_with_units(),
                    factor:   d.conversion_factor()?,
                })
            })
            .collect()
    }

    /// Rename steps restricted to one origin.
    pub fn rename_plan_for(&self, origin: ColumnOrigin) -> PipelineResult<Vec<RenameStep>> {
        self.definitions
            .iter()
            .filter(|d| d.origin == origin)
            .map(|d| {
                Ok(RenameStep {
                    original: d.original_name.clone(),
                    renamed:  d.new_name_with_units(),
                    factor:   d.conversion_factor()?,
                })
            })
            .collect()
    }

    /// Canonical names included at `tier`.
    pub fn tier_columns(&self, tier: DataTier) -> Vec<String> {
        self.definitions
            .iter()
            .filter(|d| d.in_tier(tier))
            .map(|d| d.new_name_with_units())
            .collect()
    }

    pub fn enumeration_description(&self, value: &str) -> Option<&str> {
        self.enumerations.get(value).map(String::as_str)
    }

    pub fn enumerations(&self) -> &BTreeMap<String, String> {
        &self.enumerations
    }

    /// Description and allowable enumerations for a column. `observed`
    /// holds the distinct values seen in the exported data.
    pub fn describe(&self, name: &str, observed: &BTreeSet<String>) -> Option<ColumnDescription> {
        let def = self.get(name)?;
        Some(describe_definition(def, observed, self.enumeration_threshold))
    }

    /// Resolve `requested` against the columns present in the data.
    /// In strict mode a missing column is an error; otherwise it is
    /// logged and skipped.
    pub fn require_columns(
        &self,
        requested: &[String],
        present: &[String],
        context: &str,
    ) -> PipelineResult<Vec<String>> {
        let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();
        let mut kept = Vec::with_capacity(requested.len());
        for name in requested {
            if present.contains(name.as_str()) {
                kept.push(name.clone());
            } else if self.strict {
                return Err(PipelineError::ColumnMissing {
                    column:  name.clone(),
                    context: context.to_string(),
                });
            } else {
                log::warn!("Column '{name}' not present ({context}); skipped");
            }
        }
        Ok(kept)
    }
}

/// Shared by registry and export-catalog lookups.
pub fn describe_definition(
    def: &ColumnDefinition,
    observed: &BTreeSet<String>,
    threshold: usize,
) -> ColumnDescription {
    let enumerations = match def.data_type {
        ColumnDataType::String if observed.is_empty() => AllowableEnumerations::NotEnumerated,
        ColumnDataType::String if observed.len() <= threshold => {
            AllowableEnumerations::Listed(observed.iter().cloned().collect())
        }
        ColumnDataType::String => AllowableEnumerations::TooMany,
        _ => AllowableEnumerations::NotEnumerated,
    };
    ColumnDescription {
        description: def.description.clone(),
        enumerations,
    }
}
