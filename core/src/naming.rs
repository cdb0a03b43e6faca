//! Column naming rules.
//!
//! Column names are the stable contract between stages. A canonical
//! name looks like `<prefix>.<path>..<units>`, e.g.
//! `out.electricity.heating.energy_consumption..kwh`. Every derived
//! name (weighted, savings, intensity, ...) is produced here and
//! nowhere else.

use crate::error::{PipelineError, PipelineResult};

pub const UNITS_SEPARATOR: &str = "..";

const WEIGHTED_PREFIX: &str = "calc.weighted.";
const PERCENT_SAVINGS_PREFIX: &str = "calc.percent_savings.";

/// Units suffix of a column name, or an empty string.
pub fn units_from_col_name(name: &str) -> String {
    match name.rfind(UNITS_SEPARATOR) {
        Some(idx) => name[idx + UNITS_SEPARATOR.len()..].to_string(),
        None => String::new(),
    }
}

/// Column name with the units suffix removed.
pub fn strip_units(name: &str) -> &str {
    match name.rfind(UNITS_SEPARATOR) {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Join a base name and optional units into a canonical name.
pub fn with_units(base: &str, units: Option<&str>) -> String {
    match units {
        Some(u) if !u.trim().is_empty() => format!("{base}{UNITS_SEPARATOR}{}", u.trim()),
        _ => base.to_string(),
    }
}

fn replace_units(name: &str, new_units: Option<&str>) -> String {
    match new_units {
        Some(u) => with_units(strip_units(name), Some(u)),
        None => name.to_string(),
    }
}

fn strip_leading_prefix(base: &str) -> Option<&str> {
    ["in.", "out.", "calc."]
        .iter()
        .find_map(|p| base.strip_prefix(p))
}

/// `in.x` / `out.x` / `calc.x` → `calc.weighted.x`, optionally swapping units.
pub fn col_name_to_weighted(name: &str, new_units: Option<&str>) -> PipelineResult<String> {
    if name.starts_with(WEIGHTED_PREFIX) {
        return Err(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "weighted (already weighted)",
        });
    }
    let renamed = strip_leading_prefix(name)
        .map(|rest| format!("{WEIGHTED_PREFIX}{rest}"))
        .ok_or(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "weighted",
        })?;
    Ok(replace_units(&renamed, new_units))
}

/// Weighted name with `.savings.` inserted after `.weighted.`.
pub fn col_name_to_weighted_savings(name: &str, new_units: Option<&str>) -> PipelineResult<String> {
    let weighted = col_name_to_weighted(name, new_units)?;
    Ok(weighted.replacen(".weighted.", ".weighted.savings.", 1))
}

/// Absolute-savings name for an energy, bill, peak or emissions column.
pub fn col_name_to_savings(name: &str) -> PipelineResult<String> {
    const RULES: [(&str, &str); 4] = [
        (".energy_consumption", ".energy_savings"),
        ("_bill_", "_bill_savings_"),
        ("peak_", "peak_savings_"),
        (".emissions.", ".emissions.savings."),
    ];
    let mut renamed = name.to_string();
    let mut applied = false;
    for (from, to) in RULES {
        if renamed.contains(from) {
            renamed = renamed.replacen(from, to, 1);
            applied = true;
        }
    }
    if applied {
        Ok(renamed)
    } else {
        Err(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "savings",
        })
    }
}

/// `out.<fuel>.<enduse>...` → `calc.percent_savings.<fuel>.<enduse>...` with new units.
pub fn col_name_to_percent_savings(name: &str, new_units: &str) -> PipelineResult<String> {
    let base = strip_units(name);
    let path = strip_leading_prefix(base).ok_or(PipelineError::InvalidColumnName {
        name: name.to_string(),
        rule: "percent_savings",
    })?;
    Ok(with_units(&format!("{PERCENT_SAVINGS_PREFIX}{path}"), Some(new_units)))
}

/// Energy use intensity: `..._intensity..<units>_per_ft2`. Energy columns only.
pub fn col_name_to_eui(name: &str) -> PipelineResult<String> {
    if !(name.contains(".energy_consumption") || name.contains(".energy_savings")) {
        return Err(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "eui",
        });
    }
    col_name_to_area_intensity(name)
}

/// Any per-area intensity: `..._intensity..<units>_per_ft2`.
pub fn col_name_to_area_intensity(name: &str) -> PipelineResult<String> {
    let units = units_from_col_name(name);
    if units.is_empty() {
        return Err(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "area_intensity (no units)",
        });
    }
    Ok(format!(
        "{}_intensity{UNITS_SEPARATOR}{units}_per_ft2",
        strip_units(name)
    ))
}

/// Cost per unit energy: `..._rate..<units>_per_kwh`.
pub fn col_name_to_energy_rate(name: &str) -> PipelineResult<String> {
    let units = units_from_col_name(name);
    if units.is_empty() {
        return Err(PipelineError::InvalidColumnName {
            name: name.to_string(),
            rule: "energy_rate (no units)",
        });
    }
    Ok(format!(
        "{}_rate{UNITS_SEPARATOR}{units}_per_kwh",
        strip_units(name)
    ))
}

/// Area-normalized QOI: `out.qoi.x..kw` → `calc.qoi.x_normalized..w_per_ft2`.
pub fn col_name_to_normalized(name: &str, new_units: &str) -> PipelineResult<String> {
    let base = strip_units(name);
    let path = strip_leading_prefix(base).ok_or(PipelineError::InvalidColumnName {
        name: name.to_string(),
        rule: "normalized",
    })?;
    Ok(with_units(&format!("calc.{path}_normalized"), Some(new_units)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEATING: &str = "out.natural_gas.heating.energy_consumption..kwh";

    #[test]
    fn units_are_extracted_after_double_dot() {
        assert_eq!(units_from_col_name(HEATING), "kwh");
        assert_eq!(units_from_col_name("in.comstock_building_type"), "");
    }

    #[test]
    fn weighted_swaps_prefix_and_units() {
        assert_eq!(
            col_name_to_weighted(HEATING, Some("tbtu")).unwrap(),
            "calc.weighted.natural_gas.heating.energy_consumption..tbtu"
        );
        assert_eq!(
            col_name_to_weighted("in.sqft..ft2", None).unwrap(),
            "calc.weighted.sqft..ft2"
        );
    }

    #[test]
    fn weighted_savings_inserts_segment() {
        let savings = col_name_to_savings(HEATING).unwrap();
        assert_eq!(
            col_name_to_weighted_savings(&savings, Some("tbtu")).unwrap(),
            "calc.weighted.savings.natural_gas.heating.energy_savings..tbtu"
        );
    }

    #[test]
    fn savings_rules() {
        assert_eq!(
            col_name_to_savings(HEATING).unwrap(),
            "out.natural_gas.heating.energy_savings..kwh"
        );
        assert_eq!(
            col_name_to_savings("out.utility_bills.electricity_bill_mean..usd").unwrap(),
            "out.utility_bills.electricity_bill_savings_mean..usd"
        );
        assert_eq!(
            col_name_to_savings("out.electricity.total.peak_demand..kw").unwrap(),
            "out.electricity.total.peak_savings_demand..kw"
        );
        assert_eq!(
            col_name_to_savings("out.emissions.natural_gas..co2e_kg").unwrap(),
            "out.emissions.savings.natural_gas..co2e_kg"
        );
        assert!(col_name_to_savings("in.sqft..ft2").is_err());
    }

    #[test]
    fn percent_savings_and_intensity() {
        assert_eq!(
            col_name_to_percent_savings(HEATING, "percent").unwrap(),
            "calc.percent_savings.natural_gas.heating.energy_consumption..percent"
        );
        assert_eq!(
            col_name_to_eui(HEATING).unwrap(),
            "out.natural_gas.heating.energy_consumption_intensity..kwh_per_ft2"
        );
        assert!(col_name_to_eui("out.emissions.natural_gas..co2e_kg").is_err());
        assert_eq!(
            col_name_to_energy_rate("out.utility_bills.electricity_bill_mean..usd").unwrap(),
            "out.utility_bills.electricity_bill_mean_rate..usd_per_kwh"
        );
    }
}
