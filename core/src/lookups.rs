//! Fixed lookup tables: HVAC system metadata, building-type groups,
//! piecewise bins, state identifiers and climate-zone mapping.

/// HVAC metadata for one system type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvacMetadata {
    pub system_type: &'static str,
    pub category:    &'static str,
    pub vent_type:   &'static str,
    pub heat_type:   &'static str,
    pub cool_type:   &'static str,
}

pub const SMALL_PACKAGED: &str = "Small Packaged Unit";
pub const MULTIZONE:      &str = "Multizone CAV/VAV";
pub const ZONE_BY_ZONE:   &str = "Zone-by-Zone";
pub const RESIDENTIAL:    &str = "Residential Style Central Systems";

const fn hvac(
    system_type: &'static str,
    category: &'static str,
    vent_type: &'static str,
    heat_type: &'static str,
    cool_type: &'static str,
) -> HvacMetadata {
    HvacMetadata { system_type, category, vent_type, heat_type, cool_type }
}

pub const HVAC_SYSTEMS: &[HvacMetadata] = &[
    hvac("PSZ-AC with gas coil",                      SMALL_PACKAGED, "Central Single-zone RTU", "Furnace",             "DX"),
    hvac("PSZ-AC with electric coil",                 SMALL_PACKAGED, "Central Single-zone RTU", "Electric Resistance", "DX"),
    hvac("PSZ-AC with gas boiler",                    SMALL_PACKAGED, "Central Single-zone RTU", "Boiler",              "DX"),
    hvac("PSZ-AC with district hot water",            SMALL_PACKAGED, "Central Single-zone RTU", "District",            "DX"),
    hvac("PSZ-HP",                                    SMALL_PACKAGED, "Central Single-zone RTU", "Heat Pump",           "DX"),
    hvac("PVAV with gas boiler reheat",               MULTIZONE,      "Central Multi-zone VAV",  "Boiler",              "DX"),
    hvac("PVAV with gas heat with electric reheat",   MULTIZONE,      "Central Multi-zone VAV",  "Furnace",             "DX"),
    hvac("PVAV with PFP boxes",                       MULTIZONE,      "Central Multi-zone VAV",  "Electric Resistance", "DX"),
    hvac("PVAV with district hot water reheat",       MULTIZONE,      "Central Multi-zone VAV",  "District",            "DX"),
    hvac("VAV chiller with gas boiler reheat",        MULTIZONE,      "Central Multi-zone VAV",  "Boiler",              "Chiller"),
    hvac("VAV chiller with PFP boxes",                MULTIZONE,      "Central Multi-zone VAV",  "Electric Resistance", "Chiller"),
    hvac("VAV air-cooled chiller with gas boiler reheat", MULTIZONE,  "Central Multi-zone VAV",  "Boiler",              "Chiller"),
    hvac("VAV district chilled water with district hot water reheat", MULTIZONE, "Central Multi-zone VAV", "District", "District"),
    hvac("PTAC with gas coil",                        ZONE_BY_ZONE,   "Zone-by-zone",            "Furnace",             "DX"),
    hvac("PTAC with electric coil",                   ZONE_BY_ZONE,   "Zone-by-zone",            "Electric Resistance", "DX"),
    hvac("PTAC with gas boiler",                      ZONE_BY_ZONE,   "Zone-by-zone",            "Boiler",              "DX"),
    hvac("PTHP",                                      ZONE_BY_ZONE,   "Zone-by-zone",            "Heat Pump",           "DX"),
    hvac("Fan coil chiller with boiler",              ZONE_BY_ZONE,   "Zone-by-zone",            "Boiler",              "Chiller"),
    hvac("Fan coil air-cooled chiller with boiler",   ZONE_BY_ZONE,   "Zone-by-zone",            "Boiler",              "Chiller"),
    hvac("Baseboard electric",                        ZONE_BY_ZONE,   "None",                    "Electric Resistance", "None"),
    hvac("Gas unit heaters",                          ZONE_BY_ZONE,   "None",                    "Furnace",             "None"),
    hvac("Window AC with baseboard electric",         ZONE_BY_ZONE,   "None",                    "Electric Resistance", "DX"),
    hvac("DOAS with fan coil chiller with boiler",    ZONE_BY_ZONE,   "DOAS+Zone terminal equipment", "Boiler",         "Chiller"),
    hvac("DOAS with water source heat pumps cooling tower with boiler", ZONE_BY_ZONE, "DOAS+Zone terminal equipment", "Heat Pump", "DX"),
    hvac("Residential AC with residential forced air furnace", RESIDENTIAL, "Residential forced air", "Furnace",        "DX"),
    hvac("Residential forced air furnace",            RESIDENTIAL,    "Residential forced air",  "Furnace",             "None"),
    hvac("Residential heat pump",                     RESIDENTIAL,    "Residential forced air",  "Heat Pump",           "DX"),
];

// ── Building types ──────────────────────────────────────────────────────────

pub const BUILDING_TYPE_GROUPS: &[(&str, &str)] = &[
    ("FullServiceRestaurant", "Food Service"),
    ("QuickServiceRestaurant", "Food Service"),
    ("RetailStripmall", "Mercantile"),
    ("RetailStandalone", "Mercantile"),
    ("SmallOffice", "Office"),
    ("MediumOffice", "Office"),
    ("LargeOffice", "Office"),
    ("PrimarySchool", "Education"),
    ("SecondarySchool", "Education"),
    ("Outpatient", "Healthcare"),
    ("Hospital", "Healthcare"),
    ("SmallHotel", "Lodging"),
    ("LargeHotel", "Lodging"),
    ("Warehouse", "Warehouse and Storage"),
];

pub const SCHOOL_TYPES: [&str; 2] = ["PrimarySchool", "SecondarySchool"];

/// Micro-schools are schools strictly below this floor area (ft2).
pub const MICRO_SCHOOL_MAX_SQFT: f64 = 2001.0;

/// A bucket keeps its micro-schools unless this many larger schools remain.
pub const MICRO_SCHOOL_MIN_LARGER: usize = 3;

// ── Piecewise bins ──────────────────────────────────────────────────────────

/// (exclusive upper year, label). Years at or beyond the last bound fall in the last label.
pub const VINTAGE_BINS: &[(i64, &str)] = &[
    (1946, "Before 1946"),
    (1960, "1946 to 1959"),
    (1970, "1960 to 1969"),
    (1980, "1970 to 1979"),
    (1990, "1980 to 1989"),
    (2000, "1990 to 1999"),
    (2013, "2000 to 2012"),
    (i64::MAX, "2013 or later"),
];

/// (inclusive upper sqft, label).
pub const FLOOR_AREA_BINS: &[(f64, &str)] = &[
    (5_000.0, "1,000-5,000"),
    (10_000.0, "5,001-10,000"),
    (25_000.0, "10,001-25,000"),
    (50_000.0, "25,001-50,000"),
    (100_000.0, "50,001-100,000"),
    (200_000.0, "100,001-200,000"),
    (500_000.0, "200,001-500,000"),
    (1_000_000.0, "500,001-1mil"),
    (f64::INFINITY, "Over 1mil"),
];

// ── States ──────────────────────────────────────────────────────────────────

/// (FIPS code, abbreviation, name)
pub const STATES: &[(&str, &str, &str)] = &[
    ("01", "AL", "Alabama"),
    ("02", "AK", "Alaska"),
    ("04", "AZ", "Arizona"),
    ("05", "AR", "Arkansas"),
    ("06", "CA", "California"),
    ("08", "CO", "Colorado"),
    ("09", "CT", "Connecticut"),
    ("10", "DE", "Delaware"),
    ("11", "DC", "District of Columbia"),
    ("12", "FL", "Florida"),
    ("13", "GA", "Georgia"),
    ("15", "HI", "Hawaii"),
    ("16", "ID", "Idaho"),
    ("17", "IL", "Illinois"),
    ("18", "IN", "Indiana"),
    ("19", "IA", "Iowa"),
    ("20", "KS", "Kansas"),
    ("21", "KY", "Kentucky"),
    ("22", "LA", "Louisiana"),
    ("23", "ME", "Maine"),
    ("24", "MD", "Maryland"),
    ("25", "MA", "Massachusetts"),
    ("26", "MI", "Michigan"),
    ("27", "MN", "Minnesota"),
    ("28", "MS", "Mississippi"),
    ("29", "MO", "Missouri"),
    ("30", "MT", "Montana"),
    ("31", "NE", "Nebraska"),
    ("32", "NV", "Nevada"),
    ("33", "NH", "New Hampshire"),
    ("34", "NJ", "New Jersey"),
    ("35", "NM", "New Mexico"),
    ("36", "NY", "New York"),
    ("37", "NC", "North Carolina"),
    ("38", "ND", "North Dakota"),
    ("39", "OH", "Ohio"),
    ("40", "OK", "Oklahoma"),
    ("41", "OR", "Oregon"),
    ("42", "PA", "Pennsylvania"),
    ("44", "RI", "Rhode Island"),
    ("45", "SC", "South Carolina"),
    ("46", "SD", "South Dakota"),
    ("47", "TN", "Tennessee"),
    ("48", "TX", "Texas"),
    ("49", "UT", "Utah"),
    ("50", "VT", "Vermont"),
    ("51", "VA", "Virginia"),
    ("53", "WA", "Washington"),
    ("54", "WV", "West Virginia"),
    ("55", "WI", "Wisconsin"),
    ("56", "WY", "Wyoming"),
];

/// Normalise a state identifier (`8`, `08`, `G080`) to a two-digit FIPS code.
pub fn normalize_state_fips(raw: &str) -> String {
    let digits: String = raw
        .trim()
        .trim_start_matches('G')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.len() {
        0 => raw.trim().to_string(),
        1 => format!("0{digits}"),
        2 => digits,
        _ => digits[..2].to_string(),
    }
}

pub fn state_abbreviation(state_id: &str) -> Option<&'static str> {
    let fips = normalize_state_fips(state_id);
    STATES.iter().find(|(f, _, _)| *f == fips).map(|(_, abbr, _)| *abbr)
}

pub fn state_name(abbreviation: &str) -> Option<&'static str> {
    STATES
        .iter()
        .find(|(_, abbr, _)| *abbr == abbreviation)
        .map(|(_, _, name)| *name)
}

// ── Climate zones ───────────────────────────────────────────────────────────

/// California (CEC) climate zones mapped onto ASHRAE 169-2006 zones.
pub const CEC_TO_ASHRAE: &[(&str, &str)] = &[
    ("CEC1", "4B"),
    ("CEC2", "3C"),
    ("CEC3", "3C"),
    ("CEC4", "3C"),
    ("CEC5", "3C"),
    ("CEC6", "3C"),
    ("CEC7", "3B"),
    ("CEC8", "3B"),
    ("CEC9", "3B"),
    ("CEC10", "3B"),
    ("CEC11", "3B"),
    ("CEC12", "3B"),
    ("CEC13", "3B"),
    ("CEC14", "3B"),
    ("CEC15", "2B"),
    ("CEC16", "5B"),
];

/// Map a mixed CEC/ASHRAE climate-zone code onto its ASHRAE zone.
/// ASHRAE codes (e.g. `5A`, `4C`) pass through unchanged.
pub fn ashrae_climate_zone(raw: &str) -> Option<String> {
    let code = raw.trim();
    let upper = code.to_ascii_uppercase().replace(' ', "");
    if let Some((_, ashrae)) = CEC_TO_ASHRAE.iter().find(|(cec, _)| *cec == upper) {
        return Some((*ashrae).to_string());
    }
    let mut chars = upper.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(d), None, None) if ('1'..='8').contains(&d) => Some(upper),
        (Some(d), Some(l), None) if ('1'..='8').contains(&d) && "ABC".contains(l) => Some(upper),
        _ => None,
    }
}
