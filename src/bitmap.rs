//! Bitmap-token decoding for change-event headers
//!
//! The feed encodes which fields of a record changed, were nulled, or were
//! diffed as compact bitmap tokens instead of field-name lists:
//!
//! - `"0x..."` — hex bitmask over the schema's top-level field positions
//! - `"<parentIndex>-0x..."` — hex bitmask scoped to the children of the
//!   compound field at `parentIndex`
//!
//! The bit sequence of the hex payload is interpreted in *reversed* order:
//! bit 0 of the reversed sequence selects the schema's first field. This
//! module is pure; all I/O (schema fetch, payload decode) lives elsewhere.

use apache_avro::schema::{RecordField, RecordSchema, Schema, SchemaKind};

use crate::error::{FeedError, Result};

/// Decode a batch of bitmap tokens into fully-qualified field names.
///
/// The first token, if it starts with `"0x"`, is the top-level bitmap; every
/// remaining token of the form `"<parentIndex>-<hex>"` is a nested bitmap
/// scoped to one compound field, producing `"Parent.Child"` names. Tokens of
/// neither form are ignored. Output order: top-level names in ascending bit
/// index, then nested names grouped by token in input order.
pub fn decode_fields(schema: &Schema, tokens: &[String]) -> Result<Vec<String>> {
    let record = as_record(schema)?;
    let mut names = Vec::new();

    let mut rest = tokens;
    if let Some(first) = tokens.first() {
        if first.starts_with("0x") {
            names.extend(field_names_from_bitmap(first, &record.fields)?);
            rest = &tokens[1..];
        }
    }

    for token in rest {
        let Some((parent_pos, child_hex)) = token.split_once('-') else {
            continue;
        };
        let index: usize = parent_pos.parse().map_err(|_| {
            FeedError::payload_decode(format!("invalid parent index in bitmap token {token:?}"))
        })?;
        let parent = record.fields.get(index).ok_or_else(|| {
            FeedError::payload_decode(format!(
                "bitmap token {token:?} references field index {index} out of range"
            ))
        })?;
        let child_schema = value_schema(&parent.schema)?;

        // Not a compound field: malformed token, skip it.
        let Schema::Record(child_record) = child_schema else {
            continue;
        };
        for child_name in field_names_from_bitmap(child_hex, &child_record.fields)? {
            names.push(format!("{}.{}", parent.name, child_name));
        }
    }

    Ok(names)
}

/// Expand a `"0x..."` hex bitmask into the names of the fields whose bit is
/// set, in ascending bit-index order.
fn field_names_from_bitmap(token: &str, fields: &[RecordField]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for index in set_bit_positions(token)? {
        let field = fields.get(index).ok_or_else(|| {
            FeedError::payload_decode(format!(
                "bitmap {token:?} sets bit {index} but schema has only {} fields",
                fields.len()
            ))
        })?;
        names.push(field.name.clone());
    }
    Ok(names)
}

/// Positions of set bits in a `"0x..."` hex string, after reversing the bit
/// sequence (nibbles expanded most-significant-bit first, then the whole
/// sequence reversed).
fn set_bit_positions(token: &str) -> Result<Vec<usize>> {
    let payload = token.strip_prefix("0x").ok_or_else(|| {
        FeedError::payload_decode(format!("bitmap token {token:?} missing 0x prefix"))
    })?;

    let mut bits = Vec::with_capacity(payload.len() * 4);
    for c in payload.chars() {
        let nibble = c.to_digit(16).ok_or_else(|| {
            FeedError::payload_decode(format!("bitmap token {token:?} is not valid hex"))
        })?;
        for shift in (0..4).rev() {
            bits.push((nibble >> shift) & 1 == 1);
        }
    }
    bits.reverse();

    Ok(bits
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(i, _)| i)
        .collect())
}

/// Resolve the value schema of a field whose declared type may be an
/// "absent-or-present" union.
///
/// Handles the three union shapes the feed produces: `[null, value]`,
/// `[string, value]` and `[null, string, value]`. Any other union shape is
/// an error; guessing the wrong branch would silently mis-map bit positions.
fn value_schema(field_schema: &Schema) -> Result<&Schema> {
    match field_schema {
        Schema::Union(union) => match union.variants() {
            [Schema::Null, value] => Ok(value),
            [Schema::String, value] => Ok(value),
            [Schema::Null, Schema::String, value] => Ok(value),
            variants => Err(FeedError::payload_decode(format!(
                "unsupported union shape with {} branches in compound field",
                variants.len()
            ))),
        },
        other => Ok(other),
    }
}

fn as_record(schema: &Schema) -> Result<&RecordSchema> {
    match schema {
        Schema::Record(record) => Ok(record),
        other => Err(FeedError::payload_decode(format!(
            "expected record schema for bitmap decoding, got {:?}",
            SchemaKind::from(other)
        ))),
    }
}
