//! Pure mapping between the persisted questionnaire shape and the canonical schema.
//!
//! The store keeps a few fields under older names (`description`,
//! `contact_person`) and keeps working hours as a `{day: hours}` object. The
//! form works on canonical names and on a flattened, editable working-hours
//! string. `normalize` goes storage → canonical, `denormalize` goes back.
//! Keys outside the canonical schema pass through untouched in both directions.

use anketa_types::AnketaRecord;
use serde_json::{Map, Value};

/// Legacy storage key paired with its canonical field name.
pub const FIELD_ALIASES: [(&str, &str); 2] = [
    ("description", "business_description"),
    ("contact_person", "contact_name"),
];

pub const WORKING_HOURS_FIELD: &str = "working_hours";

/// Maps a storage-shaped record to the canonical schema.
///
/// Idempotent: a canonical record is returned unchanged.
pub fn normalize(record: &AnketaRecord) -> AnketaRecord {
    let mut normalized = record.clone();

    for (legacy, canonical) in FIELD_ALIASES {
        let Some(legacy_value) = normalized.remove(legacy) else {
            continue;
        };
        let canonical_filled = normalized
            .get(canonical)
            .is_some_and(|value| !is_blank(value));
        if !canonical_filled {
            normalized.insert(canonical.to_string(), legacy_value);
        }
    }

    if let Some(Value::Object(hours)) = normalized.get(WORKING_HOURS_FIELD) {
        let flattened = flatten_working_hours(hours);
        normalized.insert(WORKING_HOURS_FIELD.to_string(), Value::String(flattened));
    }

    normalized
}

/// Maps a canonical record back to the storage shape.
pub fn denormalize(record: &AnketaRecord) -> AnketaRecord {
    let mut denormalized = record.clone();

    for (legacy, canonical) in FIELD_ALIASES {
        if let Some(value) = denormalized.remove(canonical) {
            denormalized.insert(legacy.to_string(), value);
        }
    }

    if let Some(Value::String(text)) = denormalized.get(WORKING_HOURS_FIELD) {
        if let Some(hours) = parse_working_hours(text) {
            denormalized.insert(WORKING_HOURS_FIELD.to_string(), Value::Object(hours));
        }
    }

    denormalized
}

/// Flattens `{day: hours}` into `day: hours` lines in key order.
pub fn flatten_working_hours(hours: &Map<String, Value>) -> String {
    hours
        .iter()
        .map(|(day, value)| match value {
            Value::String(text) => format!("{day}: {text}"),
            other => format!("{day}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses `day: hours` lines back into an object.
///
/// Returns `None` when any non-blank line lacks a `day:` prefix; the caller
/// then keeps the free text as typed.
pub fn parse_working_hours(text: &str) -> Option<Map<String, Value>> {
    let mut hours = Map::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (day, value) = line.split_once(':')?;
        let day = day.trim();
        if day.is_empty() {
            return None;
        }
        hours.insert(day.to_string(), Value::String(value.trim().to_string()));
    }
    Some(hours)
}

/// True for null, whitespace-only strings, and empty arrays or objects.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(entries) => entries.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::{json, Map, Value};

    use super::{denormalize, normalize, parse_working_hours};
    use anketa_types::AnketaRecord;

    fn record(value: Value) -> AnketaRecord {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn unit_normalize_renames_legacy_keys_and_flattens_hours() {
        let legacy = record(json!({
            "description": "Dental clinic",
            "contact_person": "Irina",
            "working_hours": {"mon": "9:00-18:00", "sat": "10:00-14:00"},
            "services": ["cleaning", "implants"],
        }));
        let canonical = normalize(&legacy);
        assert_eq!(
            canonical,
            record(json!({
                "business_description": "Dental clinic",
                "contact_name": "Irina",
                "working_hours": "mon: 9:00-18:00\nsat: 10:00-14:00",
                "services": ["cleaning", "implants"],
            }))
        );
        assert_eq!(denormalize(&canonical), legacy);
    }

    #[test]
    fn unit_normalize_is_noop_on_canonical_record() {
        let canonical = record(json!({
            "business_description": "Bakery",
            "working_hours": "daily: 7-20",
            "faq": [{"kind": "faq", "question": "q", "answer": "a"}],
        }));
        assert_eq!(normalize(&canonical), canonical);
    }

    #[test]
    fn regression_canonical_value_wins_over_stale_legacy_value() {
        let mixed = record(json!({
            "description": "old text",
            "business_description": "new text",
        }));
        assert_eq!(
            normalize(&mixed),
            record(json!({"business_description": "new text"}))
        );

        let blank_canonical = record(json!({
            "description": "legacy text",
            "business_description": "",
        }));
        assert_eq!(
            normalize(&blank_canonical),
            record(json!({"business_description": "legacy text"}))
        );
    }

    #[test]
    fn functional_free_text_hours_survive_denormalize() {
        let canonical = record(json!({"working_hours": "around the clock"}));
        assert_eq!(denormalize(&canonical), canonical);
        assert!(parse_working_hours("mon 9-18").is_none());
        assert!(parse_working_hours(": 9-18").is_none());
        assert_eq!(parse_working_hours("").map(|hours| hours.len()), Some(0));
    }

    fn legacy_record_strategy() -> impl Strategy<Value = AnketaRecord> {
        (
            proptest::option::of("[A-Za-z][A-Za-z ]{0,20}"),
            proptest::option::of("[A-Za-z]{1,12}"),
            proptest::option::of(proptest::collection::btree_map(
                "[a-z]{1,8}",
                "[0-9][0-9:\\-]{0,10}",
                0..5,
            )),
            proptest::collection::vec("[a-z]{1,10}", 0..4),
        )
            .prop_map(|(description, contact, hours, services)| {
                let mut record = AnketaRecord::new();
                if let Some(description) = description {
                    record.insert("description".to_string(), json!(description));
                }
                if let Some(contact) = contact {
                    record.insert("contact_person".to_string(), json!(contact));
                }
                if let Some(hours) = hours {
                    let hours = hours
                        .into_iter()
                        .map(|(day, value)| (day, Value::String(value)))
                        .collect::<Map<_, _>>();
                    record.insert("working_hours".to_string(), Value::Object(hours));
                }
                if !services.is_empty() {
                    record.insert("services".to_string(), json!(services));
                }
                record
            })
    }

    proptest! {
        #[test]
        fn property_denormalize_inverts_normalize_for_legacy_records(legacy in legacy_record_strategy()) {
            prop_assert_eq!(denormalize(&normalize(&legacy)), legacy);
        }

        #[test]
        fn property_normalize_is_idempotent(legacy in legacy_record_strategy()) {
            let once = normalize(&legacy);
            prop_assert_eq!(normalize(&once), once);
        }
    }
}
