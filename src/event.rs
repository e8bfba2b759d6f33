//! Decoded change-event representation and filtering
//!
//! A decoded event is the header sub-record plus the record's data fields.
//! After the bitmap rewrite, the header's `changed_fields`, `nulled_fields`
//! and `diff_fields` carry fully-qualified field names (dotted for nested
//! compound fields) instead of raw bitmap tokens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header sub-record of a change event.
///
/// Unknown header fields are preserved in `extra` so downstream consumers
/// see the full header even when the feed adds new metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventHeader {
    /// Name of the changed entity (e.g. "Account")
    #[serde(default)]
    pub entity_name: String,
    /// Change type: CREATE, UPDATE, DELETE, UNDELETE, or a GAP variant
    #[serde(default)]
    pub change_type: String,
    /// Origin of the change (API client, UI, ...)
    #[serde(default)]
    pub change_origin: String,
    /// Key grouping events of one transaction
    #[serde(default)]
    pub transaction_key: String,
    /// Sequence number within the transaction
    #[serde(default)]
    pub sequence_number: i64,
    /// Commit timestamp (epoch millis)
    #[serde(default)]
    pub commit_timestamp: i64,
    /// Commit number
    #[serde(default)]
    pub commit_number: i64,
    /// User that committed the change
    #[serde(default)]
    pub commit_user: String,
    /// Identifiers of the affected records
    #[serde(default)]
    pub record_ids: Vec<String>,
    /// Names of fields that changed
    #[serde(default)]
    pub changed_fields: Vec<String>,
    /// Names of fields that were set to null
    #[serde(default)]
    pub nulled_fields: Vec<String>,
    /// Names of fields carried as diffs
    #[serde(default)]
    pub diff_fields: Vec<String>,
    /// Header fields this crate does not model explicitly
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeEventHeader {
    /// Check whether a field name is flagged as changed, nulled, or diffed.
    pub fn mentions(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
            || self.diff_fields.iter().any(|f| f == field)
            || self.nulled_fields.iter().any(|f| f == field)
    }
}

/// A fully decoded change event: header plus data fields keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Change-event header with rewritten field-name lists
    #[serde(rename = "ChangeEventHeader")]
    pub header: ChangeEventHeader,
    /// Data fields of the record (header excluded)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DecodedEvent {
    /// Reduce the event to its header plus the fields flagged as changed,
    /// diffed, or nulled. Fields never mentioned in any list are dropped;
    /// an event with empty lists yields header-only output.
    pub fn filtered(&self) -> DecodedEvent {
        let fields = self
            .fields
            .iter()
            .filter(|(name, _)| self.header.mentions(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        DecodedEvent {
            header: self.header.clone(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> DecodedEvent {
        let mut fields = Map::new();
        fields.insert("a".to_string(), json!(1));
        fields.insert("b".to_string(), json!(2));
        fields.insert("c".to_string(), json!(3));

        DecodedEvent {
            header: ChangeEventHeader {
                entity_name: "Account".to_string(),
                change_type: "UPDATE".to_string(),
                changed_fields: vec!["a".to_string(), "b".to_string()],
                ..Default::default()
            },
            fields,
        }
    }

    #[test]
    fn test_filter_keeps_header_and_flagged_fields() {
        let filtered = event().filtered();

        assert_eq!(filtered.header.change_type, "UPDATE");
        assert_eq!(filtered.fields.len(), 2);
        assert!(filtered.fields.contains_key("a"));
        assert!(filtered.fields.contains_key("b"));
        assert!(!filtered.fields.contains_key("c"));
    }

    #[test]
    fn test_filter_includes_nulled_and_diff_fields() {
        let mut ev = event();
        ev.header.changed_fields = vec![];
        ev.header.nulled_fields = vec!["c".to_string()];
        ev.header.diff_fields = vec!["a".to_string()];

        let filtered = ev.filtered();
        assert!(filtered.fields.contains_key("a"));
        assert!(filtered.fields.contains_key("c"));
        assert!(!filtered.fields.contains_key("b"));
    }

    #[test]
    fn test_filter_empty_lists_yields_header_only() {
        let mut ev = event();
        ev.header.changed_fields = vec![];

        let filtered = ev.filtered();
        assert!(filtered.fields.is_empty());
        assert_eq!(filtered.header.entity_name, "Account");
    }

    #[test]
    fn test_header_mentions() {
        let header = ChangeEventHeader {
            changed_fields: vec!["Name".to_string()],
            nulled_fields: vec!["Phone".to_string()],
            diff_fields: vec!["Description".to_string()],
            ..Default::default()
        };

        assert!(header.mentions("Name"));
        assert!(header.mentions("Phone"));
        assert!(header.mentions("Description"));
        assert!(!header.mentions("Amount"));
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(event()).unwrap();

        // Header under its wire name, data fields flattened beside it.
        assert!(json.get("ChangeEventHeader").is_some());
        assert_eq!(json.get("a"), Some(&json!(1)));
        assert_eq!(
            json["ChangeEventHeader"]["changeType"],
            json!("UPDATE")
        );
    }

    #[test]
    fn test_header_preserves_unknown_fields() {
        let raw = json!({
            "entityName": "Account",
            "changeType": "CREATE",
            "somethingNew": true
        });

        let header: ChangeEventHeader = serde_json::from_value(raw).unwrap();
        assert_eq!(header.entity_name, "Account");
        assert_eq!(header.extra.get("somethingNew"), Some(&json!(true)));
    }
}
