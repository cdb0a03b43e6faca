//! Data dictionary and enumeration dictionary writers.
//!
//! Both are tab-separated and describe only columns that were actually
//! exported.

use crate::{
    column_registry::{describe_definition, AllowableEnumerations, ColumnRegistry},
    error::PipelineResult,
    export_stage::ExportReport,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DATA_DICTIONARY:        &str = "data_dictionary.tsv";
pub const ENUMERATION_DICTIONARY: &str = "enumeration_dictionary.tsv";

#[derive(Debug, Serialize)]
struct DataDictionaryRow<'a> {
    field_name:             &'a str,
    location:               &'a str,
    data_type:              &'a str,
    units:                  &'a str,
    description:            &'a str,
    allowable_enumerations: String,
}

#[derive(Debug, Serialize)]
struct EnumerationRow<'a> {
    enumeration:             &'a str,
    enumeration_description: &'a str,
}

fn tsv_writer(path: &Path) -> PipelineResult<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

/// Write both dictionaries at the output root. Returns their paths.
pub fn write_dictionaries(
    output_dir: &Path,
    registry: &ColumnRegistry,
    report: &ExportReport,
) -> PipelineResult<(PathBuf, PathBuf)> {
    let empty = BTreeSet::new();
    let threshold = registry.enumeration_threshold();
    let mut listed: BTreeSet<String> = BTreeSet::new();

    let data_path = output_dir.join(DATA_DICTIONARY);
    let mut writer = tsv_writer(&data_path)?;
    for name in &report.columns {
        let Some(def) = report.catalog.get(registry, name) else {
            log::warn!("Exported column '{name}' has no definition; left out of the dictionary");
            continue;
        };
        let observed = report.observed.get(name).unwrap_or(&empty);
        let described = describe_definition(def, observed, threshold);
        if let AllowableEnumerations::Listed(values) = &described.enumerations {
            listed.extend(values.iter().cloned());
        }
        writer.serialize(DataDictionaryRow {
            field_name: name,
            location: def.origin.name(),
            data_type: def.data_type.name(),
            units: def.units().unwrap_or_default(),
            description: &described.description,
            allowable_enumerations: described.enumerations.render(),
        })?;
    }
    writer.flush()?;

    let enum_path = output_dir.join(ENUMERATION_DICTIONARY);
    let mut writer = tsv_writer(&enum_path)?;
    for value in &listed {
        writer.serialize(EnumerationRow {
            enumeration: value,
            enumeration_description: registry.enumeration_description(value).unwrap_or_default(),
        })?;
    }
    writer.flush()?;

    log::info!(
        "Data dictionary: {} column(s); enumeration dictionary: {} value(s)",
        report.columns.len(),
        listed.len()
    );
    Ok((data_path, enum_path))
}
