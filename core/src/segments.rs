//! Building classifications built from fixed lookups: HVAC metadata,
//! addressable segments, building-type groups, vintage and floor-area bins.
//!
//! RULE: Every classification is a column expression or a join against a
//! small constant frame. No per-row functions.

use crate::{
    columns as c,
    error::{PipelineError, PipelineResult},
    kernel::{self, is_one_of},
    lookups::{
        BUILDING_TYPE_GROUPS, FLOOR_AREA_BINS, HVAC_SYSTEMS, MULTIZONE, RESIDENTIAL,
        SMALL_PACKAGED, VINTAGE_BINS, ZONE_BY_ZONE,
    },
};
use polars::prelude::*;

pub const SEGMENT_ERROR: &str = "ERROR";

/// (label, description) for each addressable segment, in cascade order.
pub const SEGMENTS: [(&str, &str); 10] = [
    ("Segment A", "Small packaged units serving food service"),
    ("Segment B", "Small packaged units serving offices"),
    ("Segment C", "Small packaged units serving other retail"),
    ("Segment D", "Small packaged units serving other building types"),
    ("Segment E", "Residential style central systems"),
    ("Segment F", "Zone-by-zone systems with heat pump or electric heat"),
    ("Segment G", "Zone-by-zone systems with other heating"),
    ("Segment H", "Multizone CAV/VAV serving healthcare"),
    ("Segment I", "Multizone CAV/VAV serving offices"),
    ("Segment J", "Multizone CAV/VAV serving other building types"),
];

const FOOD_SERVICE: [&str; 2] = ["FullServiceRestaurant", "QuickServiceRestaurant"];
const OFFICE:       [&str; 3] = ["SmallOffice", "MediumOffice", "LargeOffice"];
const RETAIL:       [&str; 2] = ["RetailStripmall", "RetailStandalone"];
const HEALTHCARE:   [&str; 2] = ["Outpatient", "Hospital"];
const ELECTRIC_HEAT: [&str; 2] = ["Heat Pump", "Electric Resistance"];

const STRIP_MALL: &str = "RetailStripmall";
const STRIP_MALL_RESTAURANT_PREFIX: &str = "strip_mall_restaurant";

// ── HVAC metadata ───────────────────────────────────────────────────────────

fn hvac_lookup_frame() -> PipelineResult<DataFrame> {
    let df = df!(
        c::HVAC_SYSTEM    => HVAC_SYSTEMS.iter().map(|h| h.system_type).collect::<Vec<_>>(),
        c::HVAC_CATEGORY  => HVAC_SYSTEMS.iter().map(|h| h.category).collect::<Vec<_>>(),
        c::HVAC_VENT_TYPE => HVAC_SYSTEMS.iter().map(|h| h.vent_type).collect::<Vec<_>>(),
        c::HVAC_HEAT_TYPE => HVAC_SYSTEMS.iter().map(|h| h.heat_type).collect::<Vec<_>>(),
        c::HVAC_COOL_TYPE => HVAC_SYSTEMS.iter().map(|h| h.cool_type).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

/// Attach HVAC category, ventilation, heating and cooling types from the
/// system-type lookup, plus their concatenation.
pub fn attach_hvac_metadata(lf: LazyFrame) -> PipelineResult<LazyFrame> {
    let present = kernel::column_names(&lf)?;
    if !present.iter().any(|n| n == c::HVAC_SYSTEM) {
        return Err(PipelineError::ColumnMissing {
            column:  c::HVAC_SYSTEM.to_string(),
            context: "HVAC metadata lookup".to_string(),
        });
    }
    let wanted = [c::HVAC_CATEGORY, c::HVAC_VENT_TYPE, c::HVAC_HEAT_TYPE, c::HVAC_COOL_TYPE];
    let missing: Vec<&str> = wanted
        .iter()
        .copied()
        .filter(|w| !present.iter().any(|n| n == w))
        .collect();

    let lf = if missing.is_empty() {
        lf
    } else {
        let mut select = vec![col(c::HVAC_SYSTEM)];
        select.extend(missing.iter().map(|m| col(*m)));
        let lookup = hvac_lookup_frame()?.lazy().select(select);
        lf.join(
            lookup,
            [col(c::HVAC_SYSTEM)],
            [col(c::HVAC_SYSTEM)],
            JoinArgs::new(JoinType::Left),
        )
    };

    Ok(lf.with_column(
        concat_str(
            [col(c::HVAC_VENT_TYPE), col(c::HVAC_HEAT_TYPE), col(c::HVAC_COOL_TYPE)],
            "_",
            true,
        )
        .alias(c::HVAC_COMBINED),
    ))
}

// ── Addressable segments ────────────────────────────────────────────────────

/// The segment cascade as a single expression. Rows no rule covers get "ERROR".
pub fn segment_expr() -> Expr {
    let bldg = || col(c::BLDG_TYPE);
    let category = || col(c::HVAC_CATEGORY);
    let small_pkg = || category().eq(lit(SMALL_PACKAGED));
    let zone = || category().eq(lit(ZONE_BY_ZONE));
    let multizone = || category().eq(lit(MULTIZONE));

    let strip_mall_restaurant = || {
        bldg().eq(lit(STRIP_MALL)).and(
            col(c::BLDG_SUBTYPE)
                .fill_null(lit(""))
                .str()
                .starts_with(lit(STRIP_MALL_RESTAURANT_PREFIX)),
        )
    };
    let food_service = is_one_of(bldg(), &FOOD_SERVICE).or(strip_mall_restaurant());
    let other_retail = is_one_of(bldg(), &RETAIL).and(strip_mall_restaurant().not());

    let rules: [(Expr, &str); 10] = [
        (small_pkg().and(food_service), SEGMENTS[0].0),
        (small_pkg().and(is_one_of(bldg(), &OFFICE)), SEGMENTS[1].0),
        (small_pkg().and(other_retail), SEGMENTS[2].0),
        (small_pkg(), SEGMENTS[3].0),
        (category().eq(lit(RESIDENTIAL)), SEGMENTS[4].0),
        (zone().and(is_one_of(col(c::HVAC_HEAT_TYPE), &ELECTRIC_HEAT)), SEGMENTS[5].0),
        (zone(), SEGMENTS[6].0),
        (multizone().and(is_one_of(bldg(), &HEALTHCARE)), SEGMENTS[7].0),
        (multizone().and(is_one_of(bldg(), &OFFICE)), SEGMENTS[8].0),
        (multizone(), SEGMENTS[9].0),
    ];

    let mut expr = lit(SEGMENT_ERROR);
    for (predicate, label) in rules.into_iter().rev() {
        expr = when(predicate.fill_null(lit(false))).then(lit(label)).otherwise(expr);
    }
    expr.alias(c::SEGMENT)
}

/// Fail if any row fell through the cascade.
pub fn check_segments(lf: &LazyFrame) -> PipelineResult<()> {
    let errors = lf
        .clone()
        .filter(col(c::SEGMENT).eq(lit(SEGMENT_ERROR)))
        .select([col(c::BUILDING_ID)])
        .collect()?;
    if errors.height() == 0 {
        return Ok(());
    }
    let ids = kernel::i64_values(&errors, c::BUILDING_ID, "segment check")?;
    Err(PipelineError::SegmentClassificationGap {
        rows:              errors.height(),
        first_building_id: ids.into_iter().flatten().next(),
    })
}

// ── Piecewise classifications ───────────────────────────────────────────────

pub fn building_type_group_expr() -> Expr {
    let mut expr = lit("Other");
    for (bldg_type, group) in BUILDING_TYPE_GROUPS.iter().rev() {
        expr = when(col(c::BLDG_TYPE).eq(lit(*bldg_type)))
            .then(lit(*group))
            .otherwise(expr);
    }
    expr.alias(c::BLDG_TYPE_GROUP)
}

pub fn vintage_expr() -> Expr {
    let year = || col(c::YEAR_BUILT).cast(DataType::Int64);
    let mut expr = lit(NULL).cast(DataType::String);
    for (upper, label) in VINTAGE_BINS.iter().rev() {
        expr = when(year().lt(lit(*upper))).then(lit(*label)).otherwise(expr);
    }
    expr.alias(c::VINTAGE)
}

pub fn floor_area_category_expr() -> Expr {
    let mut expr = lit(NULL).cast(DataType::String);
    for (upper, label) in FLOOR_AREA_BINS.iter().rev() {
        expr = when(col(c::FLR_AREA).lt_eq(lit(*upper))).then(lit(*label)).otherwise(expr);
    }
    expr.alias(c::FLR_AREA_CATEGORY)
}
