use crate::models::PropertyRecord;

/// Derived quality and completeness metrics for enrichment records.
///
/// Both functions are pure and monotonic: populating a field can never lower
/// the score. They are recomputed every time a record crosses a boundary
/// (provider response, cache read) rather than trusted from storage.

/// Field weights sum to exactly 100. Owner contact fields dominate because
/// they are what the sales pipeline actually consumes.
const WEIGHTS: &[(FieldCheck, u8)] = &[
    (|r| r.owner_name.is_some(), 10),
    (|r| r.owner_phone.is_some(), 15),
    (|r| r.owner_email.is_some(), 15),
    (|r| r.year_built.is_some(), 8),
    (|r| r.square_footage.is_some(), 8),
    (|r| r.bedrooms.is_some(), 4),
    (|r| r.bathrooms.is_some(), 4),
    (|r| r.lot_size_acres.is_some(), 4),
    (|r| r.assessed_value.is_some(), 8),
    (|r| r.market_value.is_some(), 9),
    (|r| r.last_sale_price.is_some(), 5),
    (|r| r.roof_type.is_some(), 4),
    (|r| r.roof_age_years.is_some(), 3),
    (|r| r.roof_condition.is_some(), 3),
];

type FieldCheck = fn(&PropertyRecord) -> bool;

/// Weighted 0-100 quality score over the populated-field set.
pub fn quality_score(record: &PropertyRecord) -> u8 {
    WEIGHTS
        .iter()
        .filter(|(check, _)| check(record))
        .map(|(_, weight)| weight)
        .sum()
}

/// Unweighted 0-100 share of populated fields.
pub fn data_completeness(record: &PropertyRecord) -> u8 {
    let populated = WEIGHTS.iter().filter(|(check, _)| check(record)).count();
    ((populated * 100) / WEIGHTS.len()) as u8
}

/// Stamps freshly computed quality/completeness onto a record.
pub fn annotate(record: &mut PropertyRecord) {
    record.quality_score = quality_score(record);
    record.data_completeness = data_completeness(record);
}
