//! Removal of protected fields from wire records.

use serde_json::Value;

use crate::{coerce::Record, schema::Schema};

/// Returns a copy of `record` without the protected fields that are not whitelisted.
///
/// Relation values are redacted with the related kind's own protected fields.
/// The whitelist applies at every depth.
pub fn redact(schema: &Schema, record: &Record, whitelist: &[String]) -> Record {
    let mut redacted = Record::new();

    for (key, value) in record {
        if schema.is_protected(key) && !whitelist.contains(key) {
            continue;
        }

        let value = match schema.relation(key) {
            Some(relation) => {
                let related = relation.related_schema();
                match value {
                    Value::Object(nested) => Value::Object(redact(&related, nested, whitelist)),
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(nested) => {
                                    Value::Object(redact(&related, nested, whitelist))
                                }
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                }
            }
            None => value.clone(),
        };
        redacted.insert(key.clone(), value);
    }

    redacted
}

pub fn redact_all(schema: &Schema, records: &[Record], whitelist: &[String]) -> Vec<Record> {
    records
        .iter()
        .map(|record| redact(schema, record, whitelist))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relation::{Relation, RelationKind},
        schema::FieldType,
    };
    use serde_json::json;

    fn user() -> Schema {
        Schema::builder("users")
            .field("name", FieldType::String)
            .field("password", FieldType::String)
            .protected("password")
            .build()
    }

    fn team() -> Schema {
        Schema::builder("teams")
            .field("secret", FieldType::String)
            .protected("secret")
            .relation(Relation::new("members", RelationKind::HasMany, "_id", "team_id", user))
            .build()
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn protected_fields_are_removed() {
        let input = record(json!({ "name": "ann", "password": "x" }));

        let redacted = redact(&user(), &input, &[]);
        assert_eq!(Value::Object(redacted), json!({ "name": "ann" }));
        assert!(input.contains_key("password"));
    }

    #[test]
    fn whitelist_keeps_protected_fields() {
        let input = record(json!({ "name": "ann", "password": "x" }));

        let redacted = redact(&user(), &input, &["password".to_string()]);
        assert_eq!(redacted["password"], json!("x"));
    }

    #[test]
    fn relations_use_the_related_protected_set() {
        let input = record(json!({
            "secret": "s",
            "members": [{ "name": "ann", "password": "x" }, { "name": "bob" }],
        }));

        let redacted = redact_all(&team(), &[input], &[]);
        assert_eq!(
            Value::Object(redacted[0].clone()),
            json!({ "members": [{ "name": "ann" }, { "name": "bob" }] })
        );
    }
}
