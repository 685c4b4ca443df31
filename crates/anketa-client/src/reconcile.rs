//! Merging server snapshots into the locally displayed questionnaire.
//!
//! The server is authoritative for every field the user is not touching.
//! A field that is focused or holds an unsaved local edit is never
//! overwritten; its edit record is released only when a save echo proves
//! the server holds exactly what is displayed.

use std::collections::{BTreeMap, HashMap};

use anketa_normalizer::{denormalize, normalize};
use anketa_types::{
    completion_percentage, is_canonical_field, AiBlock, AnketaRecord, FieldValue, PollSnapshot,
    SessionStatus, CANONICAL_FIELDS,
};

/// Per-field client-only edit state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldEditRecord {
    pub is_focused: bool,
    pub is_locally_dirty: bool,
    /// Last value the server reported for the field.
    pub last_known_value: FieldValue,
}

impl FieldEditRecord {
    fn is_protected(&self) -> bool {
        self.is_focused || self.is_locally_dirty
    }
}

/// What one snapshot did to the form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub overwritten: Vec<String>,
    /// Fields left untouched because the user is editing them.
    pub protected: Vec<String>,
    /// Fields that went from empty to non-empty in this cycle.
    pub freshly_filled: Vec<String>,
    /// At most one field to scroll into view.
    pub scroll_target: Option<String>,
    pub status_change: Option<SessionStatus>,
}

/// A save request: the storage-shaped payload plus the canonical values it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    pub payload: AnketaRecord,
    pub written: BTreeMap<String, FieldValue>,
}

/// Client-held questionnaire state for one session view.
#[derive(Debug, Clone)]
pub struct FormModel {
    values: BTreeMap<&'static str, FieldValue>,
    edits: HashMap<String, FieldEditRecord>,
    extension: AnketaRecord,
    ai_blocks: Vec<AiBlock>,
    status: Option<SessionStatus>,
    processing: bool,
}

impl Default for FormModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FormModel {
    pub fn new() -> Self {
        let values = CANONICAL_FIELDS
            .iter()
            .map(|spec| (spec.name, FieldValue::empty_for(spec.kind)))
            .collect();
        Self {
            values,
            edits: HashMap::new(),
            extension: AnketaRecord::new(),
            ai_blocks: Vec::new(),
            status: None,
            processing: false,
        }
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn edit_record(&self, field: &str) -> Option<&FieldEditRecord> {
        self.edits.get(field)
    }

    pub fn is_dirty(&self, field: &str) -> bool {
        self.edits
            .get(field)
            .is_some_and(|record| record.is_locally_dirty)
    }

    /// Last authoritative status observed, if any.
    pub fn status(&self) -> Option<SessionStatus> {
        self.status
    }

    pub fn processing(&self) -> bool {
        self.processing
    }

    pub fn ai_blocks(&self) -> &[AiBlock] {
        &self.ai_blocks
    }

    /// Server-authored keys outside the canonical schema.
    pub fn extension(&self) -> &AnketaRecord {
        &self.extension
    }

    pub fn focus(&mut self, field: &str) -> bool {
        let Some(record) = self.edit_record_mut(field) else {
            return false;
        };
        record.is_focused = true;
        true
    }

    pub fn blur(&mut self, field: &str) {
        if let Some(record) = self.edits.get_mut(field) {
            record.is_focused = false;
        }
    }

    /// Records a local edit. Unknown field names are ignored.
    pub fn edit(&mut self, field: &str, value: FieldValue) -> bool {
        let Some(record) = self.edit_record_mut(field) else {
            return false;
        };
        record.is_locally_dirty = true;
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
        }
        true
    }

    fn edit_record_mut(&mut self, field: &str) -> Option<&mut FieldEditRecord> {
        let (name, current) = self.values.get_key_value(field)?;
        let last_known_value = current.clone();
        Some(
            self.edits
                .entry((*name).to_string())
                .or_insert_with(|| FieldEditRecord {
                    last_known_value,
                    ..FieldEditRecord::default()
                }),
        )
    }

    /// Records a status returned by an authoritative write. Returns whether it changed.
    pub fn observe_status(&mut self, status: SessionStatus) -> bool {
        let changed = self.status != Some(status);
        self.status = Some(status);
        changed
    }

    /// Merges a storage-shaped snapshot, field by field.
    pub fn apply_snapshot(&mut self, snapshot: &PollSnapshot) -> ReconcileOutcome {
        let mut outcome = self.apply_anketa(&snapshot.anketa);
        if self.status != Some(snapshot.status) {
            outcome.status_change = Some(snapshot.status);
            self.status = Some(snapshot.status);
        }
        self.processing = snapshot.processing;
        self.ai_blocks = snapshot.ai_blocks.clone();
        outcome
    }

    fn apply_anketa(&mut self, storage: &AnketaRecord) -> ReconcileOutcome {
        let canonical = normalize(storage);
        let mut outcome = ReconcileOutcome::default();

        for spec in CANONICAL_FIELDS.iter() {
            let server_value = canonical
                .get(spec.name)
                .map(FieldValue::from_json)
                .unwrap_or_else(|| FieldValue::empty_for(spec.kind));

            if let Some(record) = self.edits.get_mut(spec.name) {
                record.last_known_value = server_value.clone();
                if record.is_protected() {
                    outcome.protected.push(spec.name.to_string());
                    continue;
                }
            }

            let Some(current) = self.values.get_mut(spec.name) else {
                continue;
            };
            if *current == server_value {
                continue;
            }
            if current.is_empty() && !server_value.is_empty() {
                outcome.freshly_filled.push(spec.name.to_string());
            }
            *current = server_value;
            outcome.overwritten.push(spec.name.to_string());
        }

        self.extension = canonical
            .into_iter()
            .filter(|(key, _)| !is_canonical_field(key))
            .collect();
        outcome.scroll_target = outcome.freshly_filled.first().cloned();
        outcome
    }

    /// Collects the form for one write, or `None` when the whole form is empty.
    ///
    /// Empty fields the user never touched are left out so the write cannot
    /// clear a value the agent stored after the last snapshot.
    pub fn prepare_save(&self) -> Option<PendingSave> {
        if self.values.values().all(FieldValue::is_empty) {
            return None;
        }
        let written: BTreeMap<String, FieldValue> = self
            .values
            .iter()
            .filter(|(name, value)| !value.is_empty() || self.is_dirty(name))
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect();
        let canonical: AnketaRecord = written
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        Some(PendingSave {
            payload: denormalize(&canonical),
            written,
        })
    }

    /// Releases dirty flags for fields whose displayed value equals the echoed
    /// stored value. Returns the released field names.
    pub fn confirm_save(&mut self, echoed: &AnketaRecord) -> Vec<String> {
        let canonical = normalize(echoed);
        let mut released = Vec::new();
        for (name, record) in self.edits.iter_mut() {
            if !record.is_locally_dirty {
                continue;
            }
            let Some(displayed) = self.values.get(name.as_str()) else {
                continue;
            };
            let Some(stored) = canonical.get(name).map(FieldValue::from_json) else {
                continue;
            };
            if *displayed == stored {
                record.is_locally_dirty = false;
                record.last_known_value = stored;
                released.push(name.clone());
            }
        }
        released.sort();
        self.edits.retain(|_, record| record.is_protected());
        released
    }

    /// The displayed values as a canonical record.
    pub fn canonical_record(&self) -> AnketaRecord {
        self.values
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.to_json()))
            .collect()
    }

    pub fn completion_percent(&self) -> u8 {
        completion_percentage(&self.canonical_record())
    }

    pub fn filled_fields(&self) -> usize {
        self.values.values().filter(|value| !value.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use anketa_types::{
        AiBlock, AnketaRecord, FieldValue, KnownAiBlock, PollSnapshot, SessionStatus,
    };
    use serde_json::{json, Value};

    use super::FormModel;

    fn snapshot(status: SessionStatus, anketa: Value) -> PollSnapshot {
        serde_json::from_value(json!({
            "session_id": "s-1",
            "status": status,
            "anketa": anketa,
            "completion_percent": 0,
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .expect("snapshot")
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    #[test]
    fn unit_snapshot_overwrites_untouched_fields_and_marks_fresh_ones() {
        let mut form = FormModel::new();
        let outcome = form.apply_snapshot(&snapshot(
            SessionStatus::Active,
            json!({
                "company_name": "Acme",
                "description": "Bakery",
                "services": ["bread", "cakes"],
                "faq": [{"kind": "faq", "question": "q", "answer": "a"}]
            }),
        ));

        assert_eq!(form.value("company_name"), Some(&text("Acme")));
        assert_eq!(form.value("business_description"), Some(&text("Bakery")));
        assert_eq!(
            form.value("services"),
            Some(&FieldValue::List(vec!["bread".to_string(), "cakes".to_string()]))
        );
        assert_eq!(outcome.freshly_filled.len(), 3);
        assert_eq!(outcome.scroll_target.as_deref(), Some("company_name"));
        assert_eq!(outcome.status_change, Some(SessionStatus::Active));
        assert!(form.extension().contains_key("faq"));
        assert!(!form.extension().contains_key("description"));
    }

    #[test]
    fn regression_dirty_field_survives_snapshot_before_save_completes() {
        let mut form = FormModel::new();
        form.apply_snapshot(&snapshot(
            SessionStatus::Active,
            json!({"company_name": "Server Co"}),
        ));
        form.edit("company_name", text("User Co"));
        form.blur("company_name");

        let outcome = form.apply_snapshot(&snapshot(
            SessionStatus::Active,
            json!({"company_name": "Agent Co", "city": "Kazan"}),
        ));
        assert_eq!(form.value("company_name"), Some(&text("User Co")));
        assert_eq!(outcome.protected, vec!["company_name".to_string()]);
        assert_eq!(form.value("city"), Some(&text("Kazan")));
        assert_eq!(
            form.edit_record("company_name").map(|record| record.last_known_value.clone()),
            Some(text("Agent Co"))
        );
    }

    #[test]
    fn unit_focused_field_is_never_overwritten() {
        let mut form = FormModel::new();
        assert!(form.focus("city"));
        form.apply_snapshot(&snapshot(SessionStatus::Active, json!({"city": "Perm"})));
        assert_eq!(form.value("city"), Some(&text("")));
        form.blur("city");
        form.apply_snapshot(&snapshot(SessionStatus::Active, json!({"city": "Perm"})));
        assert_eq!(form.value("city"), Some(&text("Perm")));
        assert!(!form.focus("not_a_field"));
    }

    #[test]
    fn functional_confirmed_save_releases_dirty_only_for_matching_values() {
        let mut form = FormModel::new();
        form.edit("company_name", text("Acme"));
        form.edit("city", text("Omsk"));
        let pending = form.prepare_save().expect("save");
        assert_eq!(pending.payload.get("company_name"), Some(&json!("Acme")));

        // The user keeps typing in `city` while the write is in flight.
        form.edit("city", text("Omsk-2"));
        let mut echoed = AnketaRecord::new();
        echoed.insert("company_name".to_string(), json!("Acme"));
        echoed.insert("city".to_string(), json!("Omsk"));
        let released = form.confirm_save(&echoed);

        assert_eq!(released, vec!["company_name".to_string()]);
        assert!(!form.is_dirty("company_name"));
        assert!(form.is_dirty("city"));

        form.apply_snapshot(&snapshot(
            SessionStatus::Active,
            json!({"company_name": "Acme", "city": "Omsk"}),
        ));
        assert_eq!(form.value("company_name"), Some(&text("Acme")));
        assert_eq!(form.value("city"), Some(&text("Omsk-2")));
    }

    #[test]
    fn unit_empty_form_skips_save_and_payload_uses_storage_shape() {
        let mut form = FormModel::new();
        assert!(form.prepare_save().is_none());
        form.edit("business_description", text("Dental clinic"));
        form.edit("working_hours", text("mon: 9-18"));
        let pending = form.prepare_save().expect("save");
        assert_eq!(pending.payload.get("description"), Some(&json!("Dental clinic")));
        assert_eq!(
            pending.payload.get("working_hours"),
            Some(&json!({"mon": "9-18"}))
        );
        assert!(!pending.payload.contains_key("business_description"));
    }

    #[test]
    fn unit_ai_blocks_are_replaced_wholesale_and_progress_counts_filled_fields() {
        let mut form = FormModel::new();
        let mut first = snapshot(SessionStatus::Reviewing, json!({"company_name": "Acme"}));
        first.ai_blocks = vec![
            AiBlock::Known(KnownAiBlock::Summary {
                text: "one".to_string(),
            }),
            AiBlock::from_value(json!({"kind": "mystery"})),
        ];
        form.apply_snapshot(&first);
        assert_eq!(form.ai_blocks().len(), 2);

        let second = snapshot(SessionStatus::Reviewing, json!({"company_name": "Acme"}));
        let outcome = form.apply_snapshot(&second);
        assert!(form.ai_blocks().is_empty());
        assert_eq!(outcome.status_change, None);
        assert_eq!(form.filled_fields(), 1);
        assert_eq!(form.completion_percent(), 4);
    }
}
