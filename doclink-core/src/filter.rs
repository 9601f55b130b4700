//! Compiles request parameters into native filter documents.
//!
//! Parameters arrive as a flat [`Params`] document. Keys naming a declared field
//! are coerced according to the field's type; keys that are not declared are
//! passed through verbatim so trusted callers can inject native operators. This
//! pass-through makes the compiler unsafe for untrusted input: sanitize request
//! parameters before they reach it.
//!
//! Dotted keys (`author.name`) address fields of a related kind. They are not
//! part of the base filter and are compiled separately by
//! [`compile_relation_filters`].

use bson::{doc, Bson, Document};
use tracing::debug;

use crate::{
    coerce::{parse_iso_date, parse_object_id},
    error::{DocumentStoreError, DocumentStoreResult},
    schema::{FieldType, Schema},
};

/// Request parameters. Values may be wire strings or already typed BSON.
pub type Params = Document;

/// Parameter keys that steer the query and never become predicates.
pub const RESERVED_KEYS: [&str; 7] = [
    "sort",
    "sort_asc",
    "sort_desc",
    "page",
    "page_size",
    "relations",
    "text_fields",
];

const OR_KEY: &str = "$or";

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Splits a separated list, trimming items and dropping empty ones.
pub fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads a list-valued parameter given either as a comma list or as an array.
pub fn list_param(params: &Params, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Bson::String(value)) => split_list(value, ','),
        Some(Bson::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .flat_map(|item| split_list(item, ','))
            .collect(),
        _ => Vec::new(),
    }
}

fn shape_of(value: &Bson) -> String {
    match value {
        Bson::Document(document) => {
            let operators: Vec<&str> = document.keys().map(String::as_str).collect();
            format!("document {{{}}}", operators.join(", "))
        }
        other => format!("{:?}", other.element_type()),
    }
}

fn unsupported(field: &str, value: &Bson) -> DocumentStoreError {
    DocumentStoreError::UnsupportedFilterShape {
        field: field.to_string(),
        shape: shape_of(value),
    }
}

fn object_id_value(field: &str, value: &Bson) -> DocumentStoreResult<Bson> {
    match value {
        Bson::ObjectId(_) => Ok(value.clone()),
        Bson::String(text) => parse_object_id(field, text).map(Bson::ObjectId),
        other => Err(unsupported(field, other)),
    }
}

fn compile_object_id(field: &str, value: &Bson) -> DocumentStoreResult<Bson> {
    match value {
        Bson::Document(operators) if operators.len() == 1 => match operators.get_array("$in") {
            Ok(items) => {
                let ids = items
                    .iter()
                    .map(|item| object_id_value(field, item))
                    .collect::<DocumentStoreResult<Vec<_>>>()?;
                Ok(Bson::Document(doc! { "$in": ids }))
            }
            Err(_) => Err(unsupported(field, value)),
        },
        other => object_id_value(field, other),
    }
}

fn compile_object_id_list(field: &str, value: &Bson) -> DocumentStoreResult<Bson> {
    let ids = match value {
        Bson::Array(items) => items
            .iter()
            .map(|item| object_id_value(field, item))
            .collect::<DocumentStoreResult<Vec<_>>>()?,
        Bson::String(text) => split_list(text, ',')
            .iter()
            .map(|item| parse_object_id(field, item).map(Bson::ObjectId))
            .collect::<DocumentStoreResult<Vec<_>>>()?,
        Bson::ObjectId(_) => vec![value.clone()],
        Bson::Document(_) => return Ok(value.clone()),
        other => return Err(unsupported(field, other)),
    };

    Ok(Bson::Document(doc! { "$all": ids }))
}

fn invalid_value(field: &str, field_type: FieldType) -> DocumentStoreError {
    DocumentStoreError::InvalidValue {
        field: field.to_string(),
        expected: field_type.name().to_string(),
    }
}

fn compile_scalar(field: &str, field_type: FieldType, text: &str) -> DocumentStoreResult<Bson> {
    let text = text.trim();
    let compiled = match field_type {
        FieldType::Integer => text
            .parse::<i64>()
            .ok()
            .or_else(|| text.parse::<f64>().ok().map(|double| double as i64))
            .map(Bson::Int64),
        FieldType::Double => text.parse::<f64>().ok().map(Bson::Double),
        FieldType::Boolean => text.parse::<bool>().ok().map(Bson::Boolean),
        _ => Some(Bson::String(text.to_string())),
    };

    compiled.ok_or_else(|| invalid_value(field, field_type))
}

fn text_search(value: &str) -> Bson {
    Bson::Document(doc! {
        "$regex": format!(".*{}.*", regex::escape(value)),
        "$options": "i",
    })
}

fn compile_field(
    field: &str,
    field_type: FieldType,
    value: &Bson,
    text_fields: &[String],
) -> DocumentStoreResult<Bson> {
    match (field_type, value) {
        (FieldType::ObjectId, value) => compile_object_id(field, value),
        (FieldType::ObjectIdList, value) => compile_object_id_list(field, value),
        (FieldType::IsoDate, Bson::String(text)) => parse_iso_date(field, text).map(Bson::DateTime),
        (FieldType::String, Bson::String(text)) if text_fields.iter().any(|name| name == field) => {
            Ok(text_search(text))
        }
        (FieldType::Integer | FieldType::Double | FieldType::Boolean, Bson::String(text)) => {
            compile_scalar(field, field_type, text)
        }
        (_, value) => Ok(value.clone()),
    }
}

/// Compiles the non-dotted parameters into a native filter.
///
/// Reserved keys are never emitted. A top-level `$or` is copied unchanged.
pub fn compile_filter(schema: &Schema, params: &Params) -> DocumentStoreResult<Document> {
    let text_fields = list_param(params, "text_fields");
    let mut filter = Document::new();

    for (key, value) in params {
        if key == OR_KEY || is_reserved(key) || key.contains('.') {
            continue;
        }

        let compiled = match schema.field_type(key) {
            Some(field_type) => compile_field(key, field_type, value, &text_fields)?,
            None => value.clone(),
        };
        filter.insert(key.clone(), compiled);
    }

    if let Some(alternatives) = params.get(OR_KEY) {
        filter.insert(OR_KEY, alternatives.clone());
    }

    Ok(filter)
}

/// Compiles dotted `relation.field` parameters.
///
/// Each suffix is compiled by the related kind's own compiler and re-prefixed,
/// producing a filter meant to run after the relations have been resolved.
/// Returns the relations the filter depends on alongside the filter.
pub fn compile_relation_filters(
    schema: &Schema,
    params: &Params,
) -> DocumentStoreResult<(Vec<String>, Document)> {
    let text_fields = list_param(params, "text_fields");
    let mut relations: Vec<String> = Vec::new();
    let mut filter = Document::new();

    for (key, value) in params {
        if key.starts_with('$') {
            continue;
        }
        let Some((prefix, suffix)) = key.split_once('.') else {
            continue;
        };
        let Some(relation) = schema.relation(prefix) else {
            debug!(
                key = %key,
                collection = schema.collection_name(),
                "dropping dotted filter without relation"
            );
            continue;
        };

        let related = relation.related_schema();
        let scoped_text_fields: Vec<String> = text_fields
            .iter()
            .filter_map(|name| name.strip_prefix(prefix)?.strip_prefix('.'))
            .map(str::to_string)
            .collect();

        let mut scoped = doc! { suffix: value.clone() };
        if !scoped_text_fields.is_empty() {
            scoped.insert("text_fields", scoped_text_fields);
        }

        let compiled = compile_filter(&related, &scoped)?;
        if compiled.is_empty() {
            return Err(unsupported(key, value));
        }

        for (field, predicate) in compiled {
            filter.insert(format!("{prefix}.{field}"), predicate);
        }
        if !relations.iter().any(|name| name == prefix) {
            relations.push(prefix.to_string());
        }
    }

    Ok((relations, filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::{Relation, RelationKind};
    use bson::oid::ObjectId;

    fn author() -> Schema {
        Schema::builder("authors")
            .field("name", FieldType::String)
            .field("age", FieldType::Integer)
            .build()
    }

    fn post() -> Schema {
        Schema::builder("posts")
            .field("title", FieldType::String)
            .field("author_id", FieldType::ObjectId)
            .field("tag_ids", FieldType::ObjectIdList)
            .field("views", FieldType::Integer)
            .field("published", FieldType::Boolean)
            .field("published_at", FieldType::IsoDate)
            .relation(Relation::new("author", RelationKind::BelongsTo, "author_id", "_id", author))
            .build()
    }

    #[test]
    fn split_list_trims_and_drops_empty_items() {
        assert_eq!(split_list(" a, b ,,c ", ','), vec!["a", "b", "c"]);
        assert!(split_list("", ',').is_empty());
    }

    #[test]
    fn reserved_keys_are_never_emitted() {
        let params = doc! {
            "sort": -1, "sort_asc": "title", "sort_desc": "views", "page": 2,
            "page_size": 10, "relations": "author", "text_fields": "title",
        };

        assert!(compile_filter(&post(), &params).unwrap().is_empty());
    }

    #[test]
    fn or_is_preserved_verbatim() {
        let alternatives = bson::bson!([{ "title": "a" }, { "views": { "$gt": 3 } }]);
        let params = doc! { "$or": alternatives.clone(), "title": "b" };

        let filter = compile_filter(&post(), &params).unwrap();
        assert_eq!(filter.get("$or"), Some(&alternatives));
        assert_eq!(filter.get_str("title").unwrap(), "b");
    }

    #[test]
    fn identifiers_are_parsed() {
        let id = ObjectId::new();
        let other = ObjectId::new();
        let params = doc! { "author_id": { "$in": [id.to_hex(), other] } };

        let filter = compile_filter(&post(), &params).unwrap();
        assert_eq!(filter, doc! { "author_id": { "$in": [id, other] } });

        let filter = compile_filter(&post(), &doc! { "author_id": id.to_hex() }).unwrap();
        assert_eq!(filter, doc! { "author_id": id });
    }

    #[test]
    fn unexpected_identifier_shapes_are_rejected() {
        let params = doc! { "author_id": { "$gt": "x" } };

        assert!(matches!(
            compile_filter(&post(), &params),
            Err(DocumentStoreError::UnsupportedFilterShape { .. })
        ));
        assert!(matches!(
            compile_filter(&post(), &doc! { "author_id": "zz" }),
            Err(DocumentStoreError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn identifier_lists_match_all() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let params = doc! { "tag_ids": format!("{},{}", a.to_hex(), b.to_hex()) };

        let filter = compile_filter(&post(), &params).unwrap();
        assert_eq!(filter, doc! { "tag_ids": { "$all": [a, b] } });
    }

    #[test]
    fn text_fields_become_escaped_case_insensitive_regexes() {
        let params = doc! { "title": "a.b", "text_fields": "title" };

        let filter = compile_filter(&post(), &params).unwrap();
        assert_eq!(filter, doc! { "title": { "$regex": ".*a\\.b.*", "$options": "i" } });
    }

    #[test]
    fn scalars_are_coerced_and_operators_pass() {
        let params = doc! {
            "views": { "$gte": 10 },
            "published": "true",
            "published_at": "2021-03-04T05:06:07Z",
            "custom": { "$exists": true },
        };

        let filter = compile_filter(&post(), &params).unwrap();
        assert_eq!(filter.get_document("views").unwrap(), &doc! { "$gte": 10 });
        assert_eq!(filter.get_bool("published").unwrap(), true);
        assert!(filter.get_datetime("published_at").is_ok());
        assert_eq!(filter.get_document("custom").unwrap(), &doc! { "$exists": true });
    }

    #[test]
    fn relation_filters_are_compiled_by_the_related_kind() {
        let params = doc! {
            "author.age": "30",
            "author.name": "ann",
            "text_fields": "author.name",
            "ghost.x": 1,
        };

        let (relations, filter) = compile_relation_filters(&post(), &params).unwrap();
        assert_eq!(relations, vec!["author".to_string()]);
        assert_eq!(
            filter,
            doc! {
                "author.age": 30_i64,
                "author.name": { "$regex": ".*ann.*", "$options": "i" },
            }
        );
    }

    #[test]
    fn relation_filter_without_predicate_is_an_error() {
        let params = doc! { "author.page": 1 };

        assert!(matches!(
            compile_relation_filters(&post(), &params),
            Err(DocumentStoreError::UnsupportedFilterShape { .. })
        ));
    }
}
