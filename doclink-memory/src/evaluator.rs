//! Query evaluation for in-memory document filtering.
//!
//! This module evaluates native filter documents (`{"age": {"$gte": 18}}`) and
//! aggregation expressions (`{"$ifNull": ["$name", null]}`) against BSON
//! documents, following the comparison rules of a document database: numbers
//! compare across integer and floating point types, equality against an array
//! field also matches its elements, and `null` matches a missing field.

use std::{cmp::Ordering, collections::HashMap};

use bson::{datetime::DateTime, oid::ObjectId, Bson, Document};
use regex::{Regex, RegexBuilder};

use doclink_core::error::{DocumentStoreError, DocumentStoreResult};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to f64. Values of different kinds order by
/// kind: null, numbers, strings, documents, arrays, identifiers, booleans, dates.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Number(f64),
    String(&'a str),
    Map(Vec<(&'a str, Comparable<'a>)>),
    Array(Vec<Comparable<'a>>),
    ObjectId(ObjectId),
    Bool(bool),
    DateTime(DateTime),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(f64::from(*value)),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Array(items) => Comparable::Array(items.iter().map(Comparable::from).collect()),
            Bson::Document(document) => Comparable::Map(
                document
                    .iter()
                    .map(|(key, value)| (key.as_str(), Comparable::from(value)))
                    .collect(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl Comparable<'_> {
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::ObjectId(_) => 5,
            Comparable::Bool(_) => 6,
            Comparable::DateTime(_) => 7,
        }
    }

    /// Total order across kinds, used for sorting.
    pub(crate) fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Ordering::Equal,
            (Comparable::Number(a), Comparable::Number(b)) => a.total_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.cmp(b),
            (Comparable::Array(a), Comparable::Array(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(left, right)| left.total_cmp(right))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Comparable::Map(a), Comparable::Map(b)) => a
                .iter()
                .zip(b.iter())
                .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| lv.total_cmp(rv)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (left, right) => left.rank().cmp(&right.rank()),
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Map(a), Comparable::Map(b)) => {
                let a: HashMap<_, _> = a.iter().map(|(key, value)| (*key, value)).collect();
                let b: HashMap<_, _> = b.iter().map(|(key, value)| (*key, value)).collect();
                a == b
            }
            (left, right) => left.total_cmp(right) == Ordering::Equal,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    /// Only values of the same kind are ordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.rank() == other.rank()).then(|| self.total_cmp(other))
    }
}

/// Collects the values reachable through a dotted path, descending into arrays.
///
/// An empty result means the path is missing.
pub(crate) fn resolve<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let mut current: Vec<&Bson> = document.get(first).into_iter().collect();

    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Bson::Document(nested) => next.extend(nested.get(segment)),
                Bson::Array(items) => match segment.parse::<usize>() {
                    Ok(index) => next.extend(items.get(index)),
                    Err(_) => next.extend(
                        items
                            .iter()
                            .filter_map(|item| item.as_document())
                            .filter_map(|nested| nested.get(segment)),
                    ),
                },
                _ => {}
            }
        }
        current = next;
    }

    current
}

/// Reads a dotted path the way aggregation field paths do.
///
/// Traversing an array yields the array of the values found in its elements.
pub(crate) fn field_value(value: &Bson, path: &str) -> Option<Bson> {
    let mut current = value.clone();

    for segment in path.split('.') {
        current = match current {
            Bson::Document(mut nested) => nested.remove(segment)?,
            Bson::Array(items) => Bson::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Bson::Document(mut nested) => nested.remove(segment),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => return None,
        };
    }

    Some(current)
}

/// Whether a value counts as true in an aggregation expression.
pub(crate) fn truthy(value: Option<&Bson>) -> bool {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => false,
        Some(Bson::Boolean(flag)) => *flag,
        Some(Bson::Int32(number)) => *number != 0,
        Some(Bson::Int64(number)) => *number != 0,
        Some(Bson::Double(number)) => *number != 0.0,
        Some(_) => true,
    }
}

fn unsupported(kind: &str, operator: &str) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("unsupported {kind} operator {operator}"))
}

fn equals(left: &Bson, right: &Bson) -> bool {
    Comparable::from(left) == Comparable::from(right)
}

/// Equality as a query sees it: array fields also match by element.
fn matches_value(values: &[&Bson], target: &Bson) -> bool {
    if matches!(target, Bson::Null) && values.is_empty() {
        return true;
    }

    values.iter().any(|value| {
        equals(value, target)
            || matches!(value, Bson::Array(items) if items.iter().any(|item| equals(item, target)))
    })
}

fn compare_any(values: &[&Bson], target: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let target = Comparable::from(target);
    let holds = |value: &Bson| {
        Comparable::from(value)
            .partial_cmp(&target)
            .is_some_and(accept)
    };

    values.iter().any(|value| match value {
        Bson::Array(items) => items.iter().any(&holds),
        other => holds(other),
    })
}

fn build_regex(pattern: &str, options: &str) -> DocumentStoreResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| DocumentStoreError::Backend(e.to_string()))
}

fn matches_regex(values: &[&Bson], regex: &Regex) -> bool {
    let hit = |value: &Bson| value.as_str().is_some_and(|text| regex.is_match(text));

    values.iter().any(|value| match value {
        Bson::Array(items) => items.iter().any(&hit),
        other => hit(other),
    })
}

fn operand_array<'a>(operator: &str, operand: &'a Bson) -> DocumentStoreResult<&'a Vec<Bson>> {
    operand
        .as_array()
        .ok_or_else(|| DocumentStoreError::Backend(format!("{operator} expects an array")))
}

fn is_operator_document(condition: &Bson) -> bool {
    match condition {
        Bson::Document(document) => document
            .keys()
            .next()
            .is_some_and(|key| key.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(values: &[&Bson], condition: &Bson) -> DocumentStoreResult<bool> {
    let Bson::Document(operators) = condition else {
        return Ok(matches_value(values, condition));
    };
    if !is_operator_document(condition) {
        return Ok(matches_value(values, condition));
    }

    for (operator, operand) in operators {
        let holds = match operator.as_str() {
            "$eq" => matches_value(values, operand),
            "$ne" => !matches_value(values, operand),
            "$gt" => compare_any(values, operand, Ordering::is_gt),
            "$gte" => compare_any(values, operand, Ordering::is_ge),
            "$lt" => compare_any(values, operand, Ordering::is_lt),
            "$lte" => compare_any(values, operand, Ordering::is_le),
            "$in" => operand_array(operator, operand)?
                .iter()
                .any(|target| matches_value(values, target)),
            "$nin" => !operand_array(operator, operand)?
                .iter()
                .any(|target| matches_value(values, target)),
            "$all" => operand_array(operator, operand)?
                .iter()
                .all(|target| matches_value(values, target)),
            "$exists" => truthy(Some(operand)) != values.is_empty(),
            "$size" => {
                let expected = Comparable::from(operand);
                values.iter().any(|value| match value {
                    Bson::Array(items) => Comparable::Number(items.len() as f64) == expected,
                    _ => false,
                })
            }
            "$regex" => {
                let options = operators.get_str("$options").unwrap_or_default();
                let Bson::String(pattern) = operand else {
                    return Err(DocumentStoreError::Backend("$regex expects a string".to_string()));
                };
                matches_regex(values, &build_regex(pattern, options)?)
            }
            "$options" => true,
            "$not" => !matches_condition(values, operand)?,
            other => return Err(unsupported("query", other)),
        };

        if !holds {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Whether `document` satisfies `filter`. `vars` are visible to `$expr`.
pub(crate) fn matches(
    document: &Document,
    filter: &Document,
    vars: &Vars,
) -> DocumentStoreResult<bool> {
    for (key, condition) in filter {
        let holds = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in operand_array(key, condition)? {
                    if !matches_clause(document, clause, vars)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in operand_array(key, condition)? {
                    if matches_clause(document, clause, vars)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in operand_array(key, condition)? {
                    if matches_clause(document, clause, vars)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$expr" => truthy(evaluate(condition, document, vars)?.as_ref()),
            operator if operator.starts_with('$') => return Err(unsupported("query", operator)),
            path => matches_condition(&resolve(document, path), condition)?,
        };

        if !holds {
            return Ok(false);
        }
    }

    Ok(true)
}

fn matches_clause(document: &Document, clause: &Bson, vars: &Vars) -> DocumentStoreResult<bool> {
    match clause {
        Bson::Document(filter) => matches(document, filter, vars),
        _ => Err(DocumentStoreError::Backend("logical clauses must be documents".to_string())),
    }
}

/// Variables bound by `$lookup` `let` and `$filter` `as`.
pub(crate) type Vars = HashMap<String, Bson>;

fn arguments<'a>(
    operator: &str,
    operand: &'a Bson,
    count: usize,
) -> DocumentStoreResult<&'a [Bson]> {
    match operand.as_array() {
        Some(items) if items.len() == count => Ok(items),
        _ => Err(DocumentStoreError::Backend(format!(
            "{operator} expects {count} arguments"
        ))),
    }
}

fn compare_expression(
    operator: &str,
    operand: &Bson,
    document: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Bson> {
    let arguments = arguments(operator, operand, 2)?;
    let left = evaluate(&arguments[0], document, vars)?;
    let right = evaluate(&arguments[1], document, vars)?;

    let ordering = match (&left, &right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => Comparable::from(left).total_cmp(&Comparable::from(right)),
    };

    let holds = match operator {
        "$eq" => ordering.is_eq(),
        "$ne" => ordering.is_ne(),
        "$gt" => ordering.is_gt(),
        "$gte" => ordering.is_ge(),
        "$lt" => ordering.is_lt(),
        _ => ordering.is_le(),
    };
    Ok(Bson::Boolean(holds))
}

/// Evaluates an aggregation expression. `None` stands for a missing value.
pub(crate) fn evaluate(
    expression: &Bson,
    document: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Option<Bson>> {
    match expression {
        Bson::String(path) if path.starts_with("$$") => {
            let reference = &path[2..];
            let (name, rest) = match reference.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (reference, None),
            };
            let value = match name {
                "ROOT" | "CURRENT" => Some(Bson::Document(document.clone())),
                _ => vars.get(name).cloned(),
            };
            Ok(match (value, rest) {
                (Some(value), Some(rest)) => field_value(&value, rest),
                (value, None) => value,
                (None, Some(_)) => None,
            })
        }
        Bson::String(path) if path.starts_with('$') => {
            let (head, rest) = match path[1..].split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (&path[1..], None),
            };
            Ok(document.get(head).and_then(|value| match rest {
                Some(rest) => field_value(value, rest),
                None => Some(value.clone()),
            }))
        }
        Bson::Array(items) => {
            let mut evaluated = Vec::with_capacity(items.len());
            for item in items {
                evaluated.push(evaluate(item, document, vars)?.unwrap_or(Bson::Null));
            }
            Ok(Some(Bson::Array(evaluated)))
        }
        Bson::Document(operators) if is_operator_document(expression) => {
            let Some((operator, operand)) = operators.iter().next() else {
                return Ok(None);
            };
            evaluate_operator(operator, operand, document, vars)
        }
        Bson::Document(fields) => {
            let mut evaluated = Document::new();
            for (key, value) in fields {
                if let Some(value) = evaluate(value, document, vars)? {
                    evaluated.insert(key.clone(), value);
                }
            }
            Ok(Some(Bson::Document(evaluated)))
        }
        literal => Ok(Some(literal.clone())),
    }
}

fn evaluate_operator(
    operator: &str,
    operand: &Bson,
    document: &Document,
    vars: &Vars,
) -> DocumentStoreResult<Option<Bson>> {
    match operator {
        "$literal" => Ok(Some(operand.clone())),
        "$ifNull" => {
            let arguments = operand_array(operator, operand)?;
            for argument in arguments {
                match evaluate(argument, document, vars)? {
                    Some(Bson::Null) | None => continue,
                    Some(value) => return Ok(Some(value)),
                }
            }
            match arguments.last() {
                Some(last) => evaluate(last, document, vars),
                None => Ok(None),
            }
        }
        "$arrayElemAt" => {
            let arguments = arguments(operator, operand, 2)?;
            let array = evaluate(&arguments[0], document, vars)?;
            let index = evaluate(&arguments[1], document, vars)?;
            let (Some(Bson::Array(items)), Some(index)) = (array, index) else {
                return Ok(None);
            };
            let index = match index {
                Bson::Int32(index) => i64::from(index),
                Bson::Int64(index) => index,
                Bson::Double(index) => index as i64,
                _ => {
                    return Err(DocumentStoreError::Backend(
                        "$arrayElemAt expects an integer index".to_string(),
                    ));
                }
            };
            let position = if index < 0 {
                i64::try_from(items.len()).unwrap_or(i64::MAX) + index
            } else {
                index
            };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|position| items.get(position).cloned()))
        }
        "$filter" => {
            let Bson::Document(arguments) = operand else {
                return Err(DocumentStoreError::Backend("$filter expects a document".to_string()));
            };
            let input = match arguments.get("input") {
                Some(input) => evaluate(input, document, vars)?,
                None => None,
            };
            let name = arguments.get_str("as").unwrap_or("this");
            let condition = arguments.get("cond").cloned().unwrap_or(Bson::Boolean(true));

            match input {
                Some(Bson::Array(items)) => {
                    let mut kept = Vec::new();
                    let mut scope = vars.clone();
                    for item in items {
                        scope.insert(name.to_string(), item.clone());
                        if truthy(evaluate(&condition, document, &scope)?.as_ref()) {
                            kept.push(item);
                        }
                    }
                    Ok(Some(Bson::Array(kept)))
                }
                None | Some(Bson::Null) => Ok(Some(Bson::Null)),
                Some(_) => Err(DocumentStoreError::Backend(
                    "$filter input must be an array".to_string(),
                )),
            }
        }
        "$in" => {
            let arguments = arguments(operator, operand, 2)?;
            let needle = evaluate(&arguments[0], document, vars)?.unwrap_or(Bson::Null);
            match evaluate(&arguments[1], document, vars)? {
                Some(Bson::Array(items)) => {
                    let found = items.iter().any(|item| equals(item, &needle));
                    Ok(Some(Bson::Boolean(found)))
                }
                _ => Err(DocumentStoreError::Backend(
                    "$in requires an array as second argument".to_string(),
                )),
            }
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            compare_expression(operator, operand, document, vars).map(Some)
        }
        "$not" => {
            let argument = match operand {
                Bson::Array(items) => items.first().cloned().unwrap_or(Bson::Null),
                other => other.clone(),
            };
            let value = evaluate(&argument, document, vars)?;
            Ok(Some(Bson::Boolean(!truthy(value.as_ref()))))
        }
        "$and" | "$or" => {
            let mut results = Vec::new();
            for argument in operand_array(operator, operand)? {
                results.push(truthy(evaluate(argument, document, vars)?.as_ref()));
            }
            let holds = if operator == "$and" {
                results.iter().all(|result| *result)
            } else {
                results.iter().any(|result| *result)
            };
            Ok(Some(Bson::Boolean(holds)))
        }
        "$size" => {
            let argument = match operand {
                Bson::Array(items) if items.len() == 1 => &items[0],
                other => other,
            };
            match evaluate(argument, document, vars)? {
                Some(Bson::Array(items)) => {
                    let size = i32::try_from(items.len()).unwrap_or(i32::MAX);
                    Ok(Some(Bson::Int32(size)))
                }
                _ => Err(DocumentStoreError::Backend("$size requires an array".to_string())),
            }
        }
        other => Err(unsupported("expression", other)),
    }
}
