//! Aggregation pipeline execution over in-memory collections.
//!
//! Supports the stages the access layer emits: `$match`, `$sort`, `$skip`,
//! `$limit`, `$project`, `$lookup` (equality and correlated forms), `$unwind`,
//! `$group` and `$count`.

use std::cmp::Ordering;

use bson::{Bson, Document};

use doclink_core::error::{DocumentStoreError, DocumentStoreResult};

use crate::{
    evaluator::{evaluate, matches, resolve, Comparable, Vars},
    store::StoreMap,
};

fn stage_error(stage: &str, message: &str) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("{stage}: {message}"))
}

fn count(stage: &str, value: &Bson) -> DocumentStoreResult<usize> {
    let count = match value {
        Bson::Int32(count) => i64::from(*count),
        Bson::Int64(count) => *count,
        Bson::Double(count) => *count as i64,
        _ => return Err(stage_error(stage, "expects a number")),
    };
    usize::try_from(count).map_err(|_| stage_error(stage, "expects a non-negative number"))
}

/// Sorts documents by a `{field: 1 | -1}` specification. The sort is stable.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    let keys: Vec<(&str, bool)> = sort
        .iter()
        .map(|(key, direction)| {
            let descending = matches!(direction, Bson::Int32(d) if *d < 0)
                || matches!(direction, Bson::Int64(d) if *d < 0)
                || matches!(direction, Bson::Double(d) if *d < 0.0);
            (key.as_str(), descending)
        })
        .collect();

    documents.sort_by(|a, b| {
        for (key, descending) in &keys {
            let left = sort_key(a, key);
            let right = sort_key(b, key);

            let ordering = left.total_cmp(&right);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn sort_key<'a>(document: &'a Document, key: &str) -> Comparable<'a> {
    resolve(document, key)
        .first()
        .map(|value| Comparable::from(*value))
        .unwrap_or(Comparable::Null)
}

fn is_inclusion(spec: &Bson) -> Option<bool> {
    match spec {
        Bson::Boolean(flag) => Some(*flag),
        Bson::Int32(flag) => Some(*flag != 0),
        Bson::Int64(flag) => Some(*flag != 0),
        Bson::Double(flag) => Some(*flag != 0.0),
        _ => None,
    }
}

fn project(
    documents: Vec<Document>,
    projection: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Vec<Document>> {
    let exclusion = projection
        .iter()
        .filter(|(key, _)| key.as_str() != "_id")
        .all(|(_, spec)| is_inclusion(spec) == Some(false))
        && !projection.is_empty();

    documents
        .into_iter()
        .map(|document| {
            if exclusion {
                let mut projected = document;
                for key in projection.keys() {
                    projected.remove(key);
                }
                return Ok(projected);
            }

            let mut projected = Document::new();
            if projection.get("_id").and_then(is_inclusion) != Some(false) {
                if let Some(id) = document.get("_id") {
                    projected.insert("_id", id.clone());
                }
            }
            for (key, spec) in projection {
                if key == "_id" && is_inclusion(spec).is_some() {
                    continue;
                }
                match is_inclusion(spec) {
                    Some(true) => {
                        if let Some(value) = document.get(key) {
                            projected.insert(key.clone(), value.clone());
                        }
                    }
                    Some(false) => {}
                    None => {
                        if let Some(value) = evaluate(spec, &document, vars)? {
                            projected.insert(key.clone(), value);
                        }
                    }
                }
            }
            Ok(projected)
        })
        .collect()
}

fn join_keys(document: &Document, path: &str) -> Vec<Bson> {
    let values = resolve(document, path);
    if values.is_empty() {
        return vec![Bson::Null];
    }

    values
        .into_iter()
        .flat_map(|value| match value {
            Bson::Array(items) if !items.is_empty() => items.clone(),
            other => vec![other.clone()],
        })
        .collect()
}

fn lookup(
    store: &StoreMap,
    documents: Vec<Document>,
    spec: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Vec<Document>> {
    let from = spec
        .get_str("from")
        .map_err(|_| stage_error("$lookup", "requires from"))?;
    let name = spec
        .get_str("as")
        .map_err(|_| stage_error("$lookup", "requires as"))?;
    let foreign: &[Document] = store.get(from).map(Vec::as_slice).unwrap_or_default();

    let mut joined = Vec::with_capacity(documents.len());
    for mut document in documents {
        let matched = if let Ok(pipeline) = spec.get_array("pipeline") {
            let mut scope = vars.clone();
            if let Ok(bindings) = spec.get_document("let") {
                for (variable, expression) in bindings {
                    let value = evaluate(expression, &document, vars)?.unwrap_or(Bson::Null);
                    scope.insert(variable.clone(), value);
                }
            }
            let stages = pipeline
                .iter()
                .map(|stage| {
                    stage
                        .as_document()
                        .cloned()
                        .ok_or_else(|| stage_error("$lookup", "pipeline stages must be documents"))
                })
                .collect::<DocumentStoreResult<Vec<_>>>()?;
            run(store, foreign.to_vec(), &stages, &scope)?
        } else {
            let local_field = spec
                .get_str("localField")
                .map_err(|_| stage_error("$lookup", "requires localField"))?;
            let foreign_field = spec
                .get_str("foreignField")
                .map_err(|_| stage_error("$lookup", "requires foreignField"))?;

            let local = join_keys(&document, local_field);
            foreign
                .iter()
                .filter(|candidate| {
                    join_keys(candidate, foreign_field).iter().any(|key| {
                        local
                            .iter()
                            .any(|value| Comparable::from(key) == Comparable::from(value))
                    })
                })
                .cloned()
                .collect()
        };

        document.insert(name, matched.into_iter().map(Bson::Document).collect::<Vec<_>>());
        joined.push(document);
    }

    Ok(joined)
}

fn unwind(documents: Vec<Document>, spec: &Bson) -> DocumentStoreResult<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(options) => (
            options
                .get_str("path")
                .map_err(|_| stage_error("$unwind", "requires path"))?,
            options
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false),
        ),
        _ => return Err(stage_error("$unwind", "expects a path or a document")),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| stage_error("$unwind", "path must start with $"))?;

    let mut unwound = Vec::new();
    for mut document in documents {
        match document.remove(field) {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    copy.insert(field, item);
                    unwound.push(copy);
                }
            }
            Some(Bson::Array(_)) | None => {
                if preserve {
                    unwound.push(document);
                }
            }
            Some(Bson::Null) => {
                if preserve {
                    document.insert(field, Bson::Null);
                    unwound.push(document);
                }
            }
            Some(other) => {
                document.insert(field, other);
                unwound.push(document);
            }
        }
    }

    Ok(unwound)
}

enum Accumulator {
    Push(Vec<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Sum(f64, bool),
}

impl Accumulator {
    fn new(operator: &str) -> DocumentStoreResult<Self> {
        match operator {
            "$push" => Ok(Accumulator::Push(Vec::new())),
            "$first" => Ok(Accumulator::First(None)),
            "$last" => Ok(Accumulator::Last(None)),
            "$sum" => Ok(Accumulator::Sum(0.0, true)),
            other => Err(stage_error("$group", &format!("unsupported accumulator {other}"))),
        }
    }

    fn add(&mut self, value: Option<Bson>, seen: bool) {
        match self {
            Accumulator::Push(items) => items.extend(value),
            Accumulator::First(first) => {
                if !seen {
                    *first = Some(value.unwrap_or(Bson::Null));
                }
            }
            Accumulator::Last(last) => *last = Some(value.unwrap_or(Bson::Null)),
            Accumulator::Sum(total, integral) => match value {
                Some(Bson::Int32(number)) => *total += f64::from(number),
                Some(Bson::Int64(number)) => *total += number as f64,
                Some(Bson::Double(number)) => {
                    *total += number;
                    *integral = false;
                }
                _ => {}
            },
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Push(items) => Bson::Array(items),
            Accumulator::First(value) | Accumulator::Last(value) => value.unwrap_or(Bson::Null),
            Accumulator::Sum(total, true) => Bson::Int64(total as i64),
            Accumulator::Sum(total, false) => Bson::Double(total),
        }
    }
}

fn group(
    documents: Vec<Document>,
    spec: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Vec<Document>> {
    let key_expression = spec
        .get("_id")
        .ok_or_else(|| stage_error("$group", "requires _id"))?;

    let mut fields = Vec::new();
    for (name, accumulator) in spec.iter().filter(|(name, _)| name.as_str() != "_id") {
        let (operator, expression) = accumulator
            .as_document()
            .and_then(|accumulator| accumulator.iter().next())
            .ok_or_else(|| stage_error("$group", "accumulators must be documents"))?;
        fields.push((name.clone(), operator.clone(), expression.clone()));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for document in &documents {
        let key = evaluate(key_expression, document, vars)?.unwrap_or(Bson::Null);
        let position = groups
            .iter()
            .position(|(existing, _)| Comparable::from(existing) == Comparable::from(&key));
        let (slot, seen) = match position {
            Some(slot) => (slot, true),
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, operator, _)| Accumulator::new(operator))
                    .collect::<DocumentStoreResult<Vec<_>>>()?;
                groups.push((key, accumulators));
                (groups.len() - 1, false)
            }
        };

        for ((_, _, expression), accumulator) in fields.iter().zip(groups[slot].1.iter_mut()) {
            accumulator.add(evaluate(expression, document, vars)?, seen);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut grouped = Document::new();
            grouped.insert("_id", key);
            for ((name, _, _), accumulator) in fields.iter().zip(accumulators) {
                grouped.insert(name.clone(), accumulator.finish());
            }
            grouped
        })
        .collect())
}

/// Runs `stages` over `documents`, reading joined collections from `store`.
pub(crate) fn run(
    store: &StoreMap,
    mut documents: Vec<Document>,
    stages: &[Document],
    vars: &Vars,
) -> DocumentStoreResult<Vec<Document>> {
    for stage in stages {
        let Some((operator, spec)) = stage.iter().next() else {
            return Err(DocumentStoreError::Backend("empty pipeline stage".to_string()));
        };

        documents = match (operator.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter, vars)? {
                        kept.push(document);
                    }
                }
                kept
            }
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut documents, sort);
                documents
            }
            ("$skip", value) => documents.into_iter().skip(count("$skip", value)?).collect(),
            ("$limit", value) => documents.into_iter().take(count("$limit", value)?).collect(),
            ("$project", Bson::Document(projection)) => project(documents, projection, vars)?,
            ("$lookup", Bson::Document(spec)) => lookup(store, documents, spec, vars)?,
            ("$unwind", spec) => unwind(documents, spec)?,
            ("$group", Bson::Document(spec)) => group(documents, spec, vars)?,
            ("$count", Bson::String(name)) => {
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let total = i32::try_from(documents.len()).unwrap_or(i32::MAX);
                    let mut counted = Document::new();
                    counted.insert(name.clone(), total);
                    vec![counted]
                }
            }
            (operator, _) => return Err(stage_error(operator, "unsupported pipeline stage")),
        };
    }

    Ok(documents)
}
