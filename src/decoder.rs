//! Binary event decoding
//!
//! Raw events arrive as an Avro-encoded payload plus the id of the schema
//! they were written with. Decoding resolves the schema through the
//! [`SchemaCache`], reads the single datum, converts it to JSON, and then
//! rewrites the header's three bitmap-token lists into field-name lists.

use std::io::Cursor;

use apache_avro::from_avro_datum;
use apache_avro::types::Value as AvroValue;
use base64::Engine;
use serde_json::Value as JsonValue;

use crate::bitmap;
use crate::error::{FeedError, Result};
use crate::event::{ChangeEventHeader, DecodedEvent};
use crate::schema::SchemaCache;

/// Wire name of the header sub-record.
pub const HEADER_FIELD: &str = "ChangeEventHeader";

/// Decodes raw events into [`DecodedEvent`]s.
///
/// Pure given a resolved schema; the only mutable state is the schema cache.
pub struct EventDecoder {
    schemas: SchemaCache,
}

impl EventDecoder {
    /// Create a decoder backed by the given schema cache.
    pub fn new(schemas: SchemaCache) -> Self {
        Self { schemas }
    }

    /// Access the underlying schema cache.
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Decode one raw event.
    ///
    /// Fails with `SchemaFetch` if the schema cannot be resolved and with
    /// `PayloadDecode` if the binary payload is malformed, the record lacks
    /// a header, or a bitmap token is invalid.
    pub async fn decode(&self, schema_id: &str, payload: &[u8]) -> Result<DecodedEvent> {
        let schema = self.schemas.get(schema_id).await?;

        let datum = from_avro_datum(schema.avro(), &mut Cursor::new(payload), None)
            .map_err(|e| {
                FeedError::payload_decode(format!("event with schema {schema_id}: {e}"))
            })?;

        let JsonValue::Object(mut record) = avro_to_json(&datum)? else {
            return Err(FeedError::payload_decode(format!(
                "event with schema {schema_id} is not a record"
            )));
        };

        let header_value = record.remove(HEADER_FIELD).ok_or_else(|| {
            FeedError::payload_decode(format!(
                "event with schema {schema_id} has no {HEADER_FIELD}"
            ))
        })?;
        let mut header: ChangeEventHeader = serde_json::from_value(header_value)
            .map_err(|e| FeedError::payload_decode(format!("malformed {HEADER_FIELD}: {e}")))?;

        // Each bitmap list is decoded independently against the full schema.
        header.changed_fields = bitmap::decode_fields(schema.avro(), &header.changed_fields)?;
        header.nulled_fields = bitmap::decode_fields(schema.avro(), &header.nulled_fields)?;
        header.diff_fields = bitmap::decode_fields(schema.avro(), &header.diff_fields)?;

        Ok(DecodedEvent {
            header,
            fields: record,
        })
    }
}

impl std::fmt::Debug for EventDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDecoder")
            .field("schemas", &self.schemas)
            .finish()
    }
}

/// Convert an Avro value to JSON.
fn avro_to_json(avro: &AvroValue) -> Result<JsonValue> {
    match avro {
        AvroValue::Null => Ok(JsonValue::Null),
        AvroValue::Boolean(b) => Ok(JsonValue::Bool(*b)),
        AvroValue::Int(i) => Ok(JsonValue::Number((*i).into())),
        AvroValue::Long(l) => Ok(JsonValue::Number((*l).into())),
        AvroValue::Float(f) => Ok(serde_json::json!(*f)),
        AvroValue::Double(d) => Ok(serde_json::json!(*d)),
        AvroValue::String(s) => Ok(JsonValue::String(s.clone())),
        AvroValue::Bytes(b) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(b);
            Ok(JsonValue::String(encoded))
        }
        AvroValue::Array(arr) => {
            let items: Result<Vec<_>> = arr.iter().map(avro_to_json).collect();
            Ok(JsonValue::Array(items?))
        }
        AvroValue::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), avro_to_json(v)?);
            }
            Ok(JsonValue::Object(obj))
        }
        AvroValue::Union(_idx, inner) => avro_to_json(inner),
        AvroValue::Record(fields) => {
            let mut obj = serde_json::Map::new();
            for (name, value) in fields {
                obj.insert(name.clone(), avro_to_json(value)?);
            }
            Ok(JsonValue::Object(obj))
        }
        AvroValue::Enum(_idx, symbol) => Ok(JsonValue::String(symbol.clone())),
        AvroValue::Fixed(_size, bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            Ok(JsonValue::String(encoded))
        }
        AvroValue::Date(d) => Ok(JsonValue::Number((*d).into())),
        AvroValue::TimeMillis(t) => Ok(JsonValue::Number((*t).into())),
        AvroValue::TimeMicros(t) => Ok(JsonValue::Number((*t).into())),
        AvroValue::TimestampMillis(t) => Ok(JsonValue::Number((*t).into())),
        AvroValue::TimestampMicros(t) => Ok(JsonValue::Number((*t).into())),
        AvroValue::Uuid(u) => Ok(JsonValue::String(u.to_string())),
        other => Err(FeedError::payload_decode(format!(
            "unsupported Avro value: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSource;
    use apache_avro::{to_avro_datum, Schema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    const ACCOUNT_SCHEMA: &str = r#"{
        "type": "record",
        "name": "AccountChangeEvent",
        "fields": [
            {"name": "ChangeEventHeader", "type": {
                "type": "record",
                "name": "ChangeEventHeader",
                "fields": [
                    {"name": "entityName", "type": "string"},
                    {"name": "changeType", "type": "string"},
                    {"name": "changeOrigin", "type": "string"},
                    {"name": "transactionKey", "type": "string"},
                    {"name": "sequenceNumber", "type": "long"},
                    {"name": "commitTimestamp", "type": "long"},
                    {"name": "commitNumber", "type": "long"},
                    {"name": "commitUser", "type": "string"},
                    {"name": "recordIds", "type": {"type": "array", "items": "string"}},
                    {"name": "changedFields", "type": {"type": "array", "items": "string"}},
                    {"name": "nulledFields", "type": {"type": "array", "items": "string"}},
                    {"name": "diffFields", "type": {"type": "array", "items": "string"}}
                ]
            }},
            {"name": "Name", "type": ["null", "string"], "default": null},
            {"name": "Amount", "type": ["null", "double"], "default": null},
            {"name": "Detail", "type": ["null", {
                "type": "record",
                "name": "Detail",
                "fields": [
                    {"name": "X", "type": ["null", "string"], "default": null},
                    {"name": "Y", "type": ["null", "string"], "default": null}
                ]
            }], "default": null}
        ]
    }"#;

    struct FixedSource;

    #[async_trait]
    impl SchemaSource for FixedSource {
        async fn fetch_schema(&self, _schema_id: &str) -> Result<String> {
            Ok(ACCOUNT_SCHEMA.to_string())
        }
    }

    fn decoder() -> EventDecoder {
        EventDecoder::new(SchemaCache::new(Arc::new(FixedSource)))
    }

    fn header_value(changed: &[&str], nulled: &[&str], diff: &[&str]) -> AvroValue {
        let strings = |items: &[&str]| {
            AvroValue::Array(
                items
                    .iter()
                    .map(|s| AvroValue::String(s.to_string()))
                    .collect(),
            )
        };
        AvroValue::Record(vec![
            ("entityName".into(), AvroValue::String("Account".into())),
            ("changeType".into(), AvroValue::String("UPDATE".into())),
            ("changeOrigin".into(), AvroValue::String("api".into())),
            ("transactionKey".into(), AvroValue::String("tx-1".into())),
            ("sequenceNumber".into(), AvroValue::Long(1)),
            ("commitTimestamp".into(), AvroValue::Long(1705000000000)),
            ("commitNumber".into(), AvroValue::Long(42)),
            ("commitUser".into(), AvroValue::String("005xx".into())),
            (
                "recordIds".into(),
                strings(&["001xx000003DGb2AAG"]),
            ),
            ("changedFields".into(), strings(changed)),
            ("nulledFields".into(), strings(nulled)),
            ("diffFields".into(), strings(diff)),
        ])
    }

    fn encode_event(changed: &[&str], nulled: &[&str], diff: &[&str]) -> Vec<u8> {
        let schema = Schema::parse_str(ACCOUNT_SCHEMA).unwrap();
        let value = AvroValue::Record(vec![
            ("ChangeEventHeader".into(), header_value(changed, nulled, diff)),
            (
                "Name".into(),
                AvroValue::Union(1, Box::new(AvroValue::String("Acme".into()))),
            ),
            (
                "Amount".into(),
                AvroValue::Union(1, Box::new(AvroValue::Double(99.5))),
            ),
            (
                "Detail".into(),
                AvroValue::Union(
                    1,
                    Box::new(AvroValue::Record(vec![
                        (
                            "X".into(),
                            AvroValue::Union(1, Box::new(AvroValue::String("x".into()))),
                        ),
                        ("Y".into(), AvroValue::Union(0, Box::new(AvroValue::Null))),
                    ])),
                ),
            ),
        ]);
        to_avro_datum(&schema, value).unwrap()
    }

    #[tokio::test]
    async fn test_decode_rewrites_bitmaps() {
        // Schema field order: header=0, Name=1, Amount=2, Detail=3.
        let payload = encode_event(&["0x04", "3-0x01"], &["0x02"], &[]);
        let event = decoder().decode("schema-1", &payload).await.unwrap();

        assert_eq!(event.header.entity_name, "Account");
        assert_eq!(event.header.change_type, "UPDATE");
        assert_eq!(event.header.changed_fields, vec!["Amount", "Detail.X"]);
        assert_eq!(event.header.nulled_fields, vec!["Name"]);
        assert!(event.header.diff_fields.is_empty());
        assert_eq!(event.header.record_ids, vec!["001xx000003DGb2AAG"]);
    }

    #[tokio::test]
    async fn test_decode_exposes_data_fields() {
        let payload = encode_event(&["0x02"], &[], &[]);
        let event = decoder().decode("schema-1", &payload).await.unwrap();

        assert_eq!(event.fields.get("Name"), Some(&json!("Acme")));
        assert_eq!(event.fields.get("Amount"), Some(&json!(99.5)));
        assert_eq!(event.fields["Detail"]["X"], json!("x"));
        assert!(!event.fields.contains_key("ChangeEventHeader"));
    }

    #[tokio::test]
    async fn test_decode_then_filter() {
        let payload = encode_event(&["0x02"], &[], &[]);
        let event = decoder().decode("schema-1", &payload).await.unwrap();

        let filtered = event.filtered();
        assert_eq!(filtered.fields.len(), 1);
        assert!(filtered.fields.contains_key("Name"));
    }

    #[tokio::test]
    async fn test_truncated_payload_fails() {
        let mut payload = encode_event(&[], &[], &[]);
        payload.truncate(payload.len() / 2);

        let err = decoder().decode("schema-1", &payload).await.unwrap_err();
        assert!(matches!(err, FeedError::PayloadDecode(_)));
    }

    #[tokio::test]
    async fn test_event_without_header_fails() {
        let schema = Schema::parse_str(
            r#"{"type": "record", "name": "Plain",
                "fields": [{"name": "id", "type": "long"}]}"#,
        )
        .unwrap();
        let payload = to_avro_datum(
            &schema,
            AvroValue::Record(vec![("id".into(), AvroValue::Long(7))]),
        )
        .unwrap();

        struct PlainSource;

        #[async_trait]
        impl SchemaSource for PlainSource {
            async fn fetch_schema(&self, _schema_id: &str) -> Result<String> {
                Ok(r#"{"type": "record", "name": "Plain",
                       "fields": [{"name": "id", "type": "long"}]}"#
                    .to_string())
            }
        }

        let decoder = EventDecoder::new(SchemaCache::new(Arc::new(PlainSource)));
        let err = decoder.decode("schema-2", &payload).await.unwrap_err();
        assert!(err.to_string().contains("ChangeEventHeader"));
    }
}
