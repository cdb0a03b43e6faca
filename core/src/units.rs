//! Unit conversion factors.
//!
//! RULE: every conversion in the pipeline goes through conv_fact().
//! Unknown pairs are an error, never a silent 1.0.

use crate::error::{PipelineError, PipelineResult};

const KWH_TO_KBTU: f64 = 3.412_141_633;

/// (from, to, factor): value_in_to = value_in_from * factor.
///
/// Million Btu is spelled `mmbtu` only; `mbtu` is not accepted.
const CONVERSIONS: &[(&str, &str, f64)] = &[
    // Energy
    ("kwh",     "kbtu",        KWH_TO_KBTU),
    ("kwh",     "mmbtu",       KWH_TO_KBTU / 1_000.0),
    ("kwh",     "tbtu",        KWH_TO_KBTU / 1_000_000_000.0),
    ("kwh",     "mwh",         1.0e-3),
    ("kwh",     "gwh",         1.0e-6),
    ("kwh",     "twh",         1.0e-9),
    ("kwh",     "therm",       KWH_TO_KBTU / 100.0),
    ("kbtu",    "kwh",         1.0 / KWH_TO_KBTU),
    ("therm",   "kwh",         100.0 / KWH_TO_KBTU),
    ("mmbtu",   "kwh",         1_000.0 / KWH_TO_KBTU),
    ("gj",      "kwh",         277.777_777_777_777_8),
    ("j",       "kwh",         1.0 / 3_600_000.0),
    // Demand
    ("kw",      "w",           1_000.0),
    ("kw",      "mw",          1.0e-3),
    ("kw",      "gw",          1.0e-6),
    ("w",       "kw",          1.0e-3),
    // Intensity
    ("kwh_per_ft2", "kbtu_per_ft2", KWH_TO_KBTU),
    ("kw_per_ft2",  "w_per_ft2",    1_000.0),
    // Emissions
    ("co2e_kg", "co2e_mt",     1.0e-3),
    ("co2e_kg", "co2e_mmt",    1.0e-9),
    ("co2e_mt", "co2e_kg",     1_000.0),
    ("lb",      "co2e_kg",     0.453_592_37),
    // Cost
    ("usd",     "thousand_usd", 1.0e-3),
    ("usd",     "million_usd",  1.0e-6),
    ("usd",     "billion_usd",  1.0e-9),
    ("cents",   "usd",          1.0e-2),
    // Area
    ("ft2",     "m2",          0.092_903_04),
    ("m2",      "ft2",         10.763_910_416_709_722),
    ("ft2",     "million_ft2", 1.0e-6),
    ("ft2",     "billion_ft2", 1.0e-9),
    // Ratios
    ("fraction", "percent",    100.0),
    ("percent",  "fraction",   0.01),
];

/// Scalar factor converting `from_units` into `to_units`.
///
/// Identity pairs always return 1.0, including for units the table
/// does not otherwise know about.
pub fn conv_fact(from_units: &str, to_units: &str) -> PipelineResult<f64> {
    let from = from_units.trim().to_ascii_lowercase();
    let to = to_units.trim().to_ascii_lowercase();
    if from == to {
        return Ok(1.0);
    }
    CONVERSIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, factor)| *factor)
        .ok_or(PipelineError::UnknownUnitConversion {
            from: from_units.to_string(),
            to:   to_units.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_one() {
        assert_eq!(conv_fact("kwh", "kwh").unwrap(), 1.0);
        assert_eq!(conv_fact("widgets", "widgets").unwrap(), 1.0);
    }

    #[test]
    fn kwh_to_tbtu_matches_kbtu_chain() {
        let direct = conv_fact("kwh", "tbtu").unwrap();
        let chained = conv_fact("kwh", "kbtu").unwrap() * 1.0e-9;
        assert!((direct - chained).abs() < 1e-20);
    }

    #[test]
    fn million_btu_has_a_single_spelling() {
        let mmbtu = conv_fact("kwh", "mmbtu").unwrap();
        assert!((mmbtu - conv_fact("kwh", "kbtu").unwrap() / 1_000.0).abs() < 1e-15);
        let err = conv_fact("kwh", "mbtu").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownUnitConversion);
    }

    #[test]
    fn unknown_pair_fails() {
        let err = conv_fact("kwh", "usd").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownUnitConversion);
    }
}
