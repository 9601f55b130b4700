//! Conversion between the wire representation and the storage representation.
//!
//! Records travel over the wire as JSON objects where identifiers are hex
//! strings and dates are ISO-8601 strings. In storage they are BSON documents
//! holding native `ObjectId` and `DateTime` values. [`preparse`] converts wire to
//! storage, [`represent`] converts back. Both only touch fields that are present
//! and not null, so absence is preserved across the round trip.

use bson::{oid::ObjectId, Bson, DateTime, Document};
use chrono::{NaiveDateTime, SecondsFormat};
use serde_json::{Map, Number, Value};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::split_list,
    schema::{FieldType, Schema},
};

/// A record in wire representation.
pub type Record = Map<String, Value>;

const ISO_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parses a 24 character hex string into an identifier.
pub fn parse_object_id(field: &str, value: &str) -> DocumentStoreResult<ObjectId> {
    ObjectId::parse_str(value.trim()).map_err(|_| DocumentStoreError::InvalidIdentifier {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parses an ISO-8601 date, reading only the first 19 characters.
///
/// Fractional seconds and zone designators are ignored; the value is taken as UTC.
pub fn parse_iso_date(field: &str, value: &str) -> DocumentStoreResult<DateTime> {
    let head = value.get(..19).unwrap_or(value);

    NaiveDateTime::parse_from_str(head, ISO_DATE_FORMAT)
        .map(|naive| DateTime::from_chrono(naive.and_utc()))
        .map_err(|_| DocumentStoreError::InvalidDate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// Formats a date as RFC 3339 with a trailing `Z`.
///
/// Sub-second digits are only emitted when non-zero.
pub fn format_iso_date(value: &DateTime) -> String {
    value
        .to_chrono()
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Converts a wire value into BSON without any schema knowledge.
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(flag) => Bson::Boolean(*flag),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Bson::Int64(integer)
            } else {
                Bson::Double(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(text) => Bson::String(text.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_bson(value)))
                .collect(),
        ),
    }
}

/// Converts a BSON value into its wire form.
///
/// Identifiers become hex strings and dates become ISO strings, at any depth.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(flag) => Value::Bool(*flag),
        Bson::Int32(integer) => Value::from(*integer),
        Bson::Int64(integer) => Value::from(*integer),
        Bson::Double(double) => Number::from_f64(*double)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(text) => Value::String(text.clone()),
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(date) => Value::String(format_iso_date(date)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(document) => Value::Object(document_to_json(document)),
        other => Value::String(other.to_string()),
    }
}

fn document_to_json(document: &Document) -> Record {
    document
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

fn invalid_value(field: &str, field_type: FieldType) -> DocumentStoreError {
    DocumentStoreError::InvalidValue {
        field: field.to_string(),
        expected: field_type.name().to_string(),
    }
}

/// Coerces one wire value to the storage form of `field_type`.
pub fn coerce_value(
    field: &str,
    field_type: FieldType,
    value: &Value,
) -> DocumentStoreResult<Bson> {
    let coerced = match (field_type, value) {
        (FieldType::String, Value::String(text)) => Bson::String(text.clone()),
        (FieldType::String, other) => Bson::String(other.to_string()),

        (FieldType::Integer, Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|double| double as i64))
            .map(Bson::Int64)
            .ok_or_else(|| invalid_value(field, field_type))?,
        (FieldType::Integer, Value::String(text)) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(|double| double as i64))
                .map(Bson::Int64)
                .ok_or_else(|| invalid_value(field, field_type))?
        }
        (FieldType::Integer, _) => return Err(invalid_value(field, field_type)),

        (FieldType::Double, Value::Number(number)) => number
            .as_f64()
            .map(Bson::Double)
            .ok_or_else(|| invalid_value(field, field_type))?,
        (FieldType::Double, Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map(Bson::Double)
            .map_err(|_| invalid_value(field, field_type))?,
        (FieldType::Double, _) => return Err(invalid_value(field, field_type)),

        (FieldType::ObjectId, Value::String(text)) => Bson::ObjectId(parse_object_id(field, text)?),
        (FieldType::ObjectId, other) => {
            return Err(DocumentStoreError::InvalidIdentifier {
                field: field.to_string(),
                value: other.to_string(),
            });
        }

        (FieldType::ObjectIdList, Value::Array(items)) => Bson::Array(
            items
                .iter()
                .map(|item| coerce_value(field, FieldType::ObjectId, item))
                .collect::<DocumentStoreResult<_>>()?,
        ),
        (FieldType::ObjectIdList, Value::String(text)) => Bson::Array(
            split_list(text, ',')
                .iter()
                .map(|item| parse_object_id(field, item).map(Bson::ObjectId))
                .collect::<DocumentStoreResult<_>>()?,
        ),
        (FieldType::ObjectIdList, other) => {
            return Err(DocumentStoreError::InvalidIdentifier {
                field: field.to_string(),
                value: other.to_string(),
            });
        }

        (FieldType::IsoDate, Value::String(text)) => Bson::DateTime(parse_iso_date(field, text)?),
        (FieldType::IsoDate, other) => {
            return Err(DocumentStoreError::InvalidDate {
                field: field.to_string(),
                value: other.to_string(),
            });
        }

        (FieldType::Boolean | FieldType::Object | FieldType::Array, other) => json_to_bson(other),
    };

    Ok(coerced)
}

/// Converts a wire record into a storage document.
///
/// Only declared fields are kept, in declaration order. Fields that are absent
/// or null in the input are absent from the output.
pub fn preparse(schema: &Schema, record: &Record) -> DocumentStoreResult<Document> {
    let mut document = Document::new();

    for descriptor in schema.describe() {
        match record.get(&descriptor.name) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                let coerced = coerce_value(&descriptor.name, descriptor.field_type, value)?;
                document.insert(descriptor.name.clone(), coerced);
            }
        }
    }

    Ok(document)
}

/// Converts a storage document back into a wire record.
///
/// Keys naming a relation are represented with the related kind's schema.
pub fn represent(schema: &Schema, document: &Document) -> Record {
    let mut record = Record::new();

    for (key, value) in document {
        let represented = if let Some(relation) = schema.relation(key) {
            let related = relation.related_schema();
            match value {
                Bson::Document(nested) => Value::Object(represent(&related, nested)),
                Bson::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Bson::Document(nested) => Value::Object(represent(&related, nested)),
                            other => bson_to_json(other),
                        })
                        .collect(),
                ),
                other => bson_to_json(other),
            }
        } else {
            match (schema.field_type(key), value) {
                (Some(FieldType::Integer), Bson::Double(double)) => Value::from(*double as i64),
                (_, other) => bson_to_json(other),
            }
        };

        record.insert(key.clone(), represented);
    }

    record
}
