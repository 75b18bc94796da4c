use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{FieldName, Fields, Record, RecordId, SortDirection, SortField, SortSpec};

/// Parses a calendar date in exactly `YYYY-MM-DD` form.
pub fn parse_strict_date(raw: &str) -> Option<NaiveDate> {
    let bytes = raw.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &bytes[range];
        if !part.iter().all(u8::is_ascii_digit) {
            return None;
        }
        part.iter()
            .try_fold(0u32, |acc, b| acc.checked_mul(10)?.checked_add(u32::from(b - b'0')))
    };
    let year = i32::try_from(digits(0..4)?).ok()?;
    NaiveDate::from_ymd_opt(year, digits(5..7)?, digits(8..10)?)
}

pub struct SortEngine;

impl SortEngine {
    /// Display order of `records` under `spec`.
    ///
    /// With no spec this is first-seen order. Otherwise records are compared
    /// by the parsed date in the requested direction; unparsable or empty
    /// values always come last, and ties keep first-seen order.
    pub fn materialize<'a>(
        records: impl IntoIterator<Item = &'a Record>,
        spec: Option<SortSpec>,
    ) -> Vec<RecordId> {
        let mut keyed: Vec<(Option<NaiveDate>, &'a Record)> = match spec {
            None => records.into_iter().map(|r| (None, r)).collect(),
            Some(spec) => records
                .into_iter()
                .map(|r| (parse_strict_date(r.field(spec.field.field())), r))
                .collect(),
        };

        let direction = spec.map(|s| s.direction);
        keyed.sort_by(|(a_date, a), (b_date, b)| {
            compare_dates(*a_date, *b_date, direction)
                .then_with(|| a.first_seen_index().cmp(&b.first_seen_index()))
        });

        keyed.into_iter().map(|(_, r)| r.id().clone()).collect()
    }
}

fn compare_dates(
    a: Option<NaiveDate>,
    b: Option<NaiveDate>,
    direction: Option<SortDirection>,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match direction {
            Some(SortDirection::Descending) => b.cmp(&a),
            _ => a.cmp(&b),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Active single-column sort plus the direction each field was last sorted in.
#[derive(Debug, Default)]
pub struct SortState {
    active: Option<SortSpec>,
    directions: HashMap<SortField, SortDirection>,
}

impl SortState {
    pub fn active(&self) -> Option<SortSpec> {
        self.active
    }

    /// Replaces any previous spec.
    pub fn set(&mut self, spec: SortSpec) {
        self.directions.insert(spec.field, spec.direction);
        self.active = Some(spec);
    }

    pub fn reset(&mut self) {
        self.active = None;
    }

    /// Flips the remembered direction of `field` and activates it. Every
    /// field starts out ascending, so the first toggle sorts descending.
    pub fn toggle(&mut self, field: SortField) -> SortSpec {
        let direction = self
            .directions
            .get(&field)
            .copied()
            .unwrap_or(SortDirection::Ascending)
            .flip();
        let spec = SortSpec { field, direction };
        self.set(spec);
        spec
    }
}

/// Case-insensitive substring filter on one column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: FieldName,
    pub term: String,
}

impl RowFilter {
    pub fn new(field: FieldName, term: impl Into<String>) -> Self {
        Self {
            field,
            term: term.into(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields
            .value(self.field)
            .to_lowercase()
            .contains(&self.term.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordPayload;
    use crate::record_store::RecordStore;

    fn store_with_ship_dates(dates: &[&str]) -> RecordStore {
        let mut store = RecordStore::new();
        for (i, date) in dates.iter().enumerate() {
            let fields = Fields::new().with(FieldName::ShipDate, *date);
            store.upsert(&RecordId::new((i + 1).to_string()), &RecordPayload::new(fields));
        }
        store
    }

    fn ids(order: Vec<RecordId>) -> Vec<String> {
        order.into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn strict_dates_only() {
        assert_eq!(parse_strict_date("2024-01-05"), NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(parse_strict_date("2024-1-5"), None);
        assert_eq!(parse_strict_date("2024-02-30"), None);
        assert_eq!(parse_strict_date("2024/01/05"), None);
        assert_eq!(parse_strict_date(" 2024-01-05"), None);
        assert_eq!(parse_strict_date("+024-01-05"), None);
        assert_eq!(parse_strict_date(""), None);
    }

    #[test]
    fn ship_date_example_orders() {
        let store = store_with_ship_dates(&["2024-01-05", "", "2024-01-01"]);

        let asc = SortEngine::materialize(store.all(), Some(SortSpec::ascending(SortField::ShipDate)));
        assert_eq!(ids(asc), ["3", "1", "2"]);

        let desc =
            SortEngine::materialize(store.all(), Some(SortSpec::descending(SortField::ShipDate)));
        assert_eq!(ids(desc), ["1", "3", "2"]);

        let natural = SortEngine::materialize(store.all(), None);
        assert_eq!(ids(natural), ["1", "2", "3"]);
    }

    #[test]
    fn equal_dates_keep_first_seen_order_in_both_directions() {
        let store = store_with_ship_dates(&["2024-03-01", "bad", "2024-03-01", "", "2024-03-01"]);

        let asc = SortEngine::materialize(store.all(), Some(SortSpec::ascending(SortField::ShipDate)));
        assert_eq!(ids(asc), ["1", "3", "5", "2", "4"]);

        let desc =
            SortEngine::materialize(store.all(), Some(SortSpec::descending(SortField::ShipDate)));
        assert_eq!(ids(desc), ["1", "3", "5", "2", "4"]);
    }

    #[test]
    fn toggle_starts_descending_and_alternates() {
        let mut state = SortState::default();
        assert_eq!(state.toggle(SortField::ReceiptDate).direction, SortDirection::Descending);
        assert_eq!(state.toggle(SortField::ReceiptDate).direction, SortDirection::Ascending);
        assert_eq!(state.toggle(SortField::ShipDate).direction, SortDirection::Descending);
        assert_eq!(state.active().map(|s| s.field), Some(SortField::ShipDate));
        state.reset();
        assert_eq!(state.active(), None);
        assert_eq!(state.toggle(SortField::ReceiptDate).direction, SortDirection::Descending);
    }

    #[test]
    fn filter_is_case_insensitive_substring() {
        let fields = Fields::new().with(FieldName::Company, "ACME Marine");
        assert!(RowFilter::new(FieldName::Company, "marine").matches(&fields));
        assert!(RowFilter::new(FieldName::Company, "").matches(&fields));
        assert!(!RowFilter::new(FieldName::Company, "sea").matches(&fields));
        assert!(!RowFilter::new(FieldName::Note, "a").matches(&fields));
    }
}
