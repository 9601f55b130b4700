//! Aggregation pipeline synthesis for relation resolution.
//!
//! [`PipelineBuilder`] turns a compiled filter, a set of requested relations
//! and optional pagination into the ordered stages a backend executes with a
//! single `aggregate` round trip. Stage layout:
//!
//! 1. `$match` on the base filter
//! 2. `$sort`/`$skip`/`$limit` when paginated, or `$sort` alone when sorted
//! 3. relation lookups, in relation name order
//! 4. `$project` of the declared fields and the resolved relations
//! 5. `$match` on relation-scoped filters, when any
//! 6. a trailing `$sort` when paginated or sorted
//!
//! Pipelines are built fresh per call and never shared.

use bson::{doc, Bson, Document};
use tracing::debug;

use crate::{
    page::{Pagination, SortSpec},
    relation::{Relation, RelationKind},
    schema::{Schema, DELETED_AT, ID_FIELD},
};

/// Ordered aggregation stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Document>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Document] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Document> {
        self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The operator of each stage, e.g. `["$match", "$lookup", "$project"]`.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|stage| stage.keys().next().map(String::as_str))
            .collect()
    }
}

/// Builds a [`Pipeline`] for one record kind.
///
/// # Example
///
/// ```ignore
/// let pipeline = PipelineBuilder::new(&schema, filter)
///     .relations(["author", "tags"])
///     .paginate(pagination)
///     .build();
/// ```
pub struct PipelineBuilder<'a> {
    schema: &'a Schema,
    filter: Document,
    relations: Vec<String>,
    whitelist: Vec<String>,
    pagination: Option<Pagination>,
    sort: Option<SortSpec>,
    relation_filter: Document,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(schema: &'a Schema, filter: Document) -> Self {
        Self {
            schema,
            filter,
            relations: Vec::new(),
            whitelist: Vec::new(),
            pagination: None,
            sort: None,
            relation_filter: Document::new(),
        }
    }

    /// Relations to resolve. Unknown names are ignored.
    pub fn relations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations.extend(names.into_iter().map(Into::into));
        self
    }

    /// Protected fields to keep in the projection.
    pub fn whitelist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Explicit sort for unpaginated reads.
    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Filter on resolved relation fields, applied after the projection.
    pub fn relation_filter(mut self, filter: Document) -> Self {
        self.relation_filter.extend(filter);
        self
    }

    fn resolved_relations(&self) -> Vec<&'a Relation> {
        let mut names: Vec<&str> = self.relations.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();

        names
            .into_iter()
            .filter_map(|name| {
                let relation = self.schema.relation(name);
                if relation.is_none() {
                    debug!(
                        relation = name,
                        collection = self.schema.collection_name(),
                        "ignoring unknown relation"
                    );
                }
                relation
            })
            .collect()
    }

    pub fn build(self) -> Pipeline {
        let mut stages = vec![doc! { "$match": self.filter.clone() }];

        let sort = match (&self.pagination, &self.sort) {
            (Some(pagination), _) => {
                stages.push(doc! { "$sort": pagination.sort.to_document() });
                stages.push(doc! { "$skip": i64::try_from(pagination.skip()).unwrap_or(i64::MAX) });
                stages.push(doc! { "$limit": pagination.limit() });
                Some(pagination.sort.to_document())
            }
            (None, Some(sort)) => {
                stages.push(doc! { "$sort": sort.to_document() });
                Some(sort.to_document())
            }
            (None, None) => None,
        };

        let mut projection = Document::new();
        for descriptor in self.schema.describe() {
            let hidden = self.schema.is_protected(&descriptor.name)
                && !self.whitelist.contains(&descriptor.name);
            if hidden {
                continue;
            }
            projection.insert(descriptor.name.clone(), true);
        }

        let mut resolved: Vec<&str> = Vec::new();
        for relation in self.resolved_relations() {
            let name = relation.name();
            let from = relation.related_schema().collection_name().to_string();

            match relation.kind() {
                RelationKind::HasOne | RelationKind::BelongsTo => {
                    stages.push(lookup(&from, relation.local_key(), relation.foreign_key(), name));
                    projection.insert(name, first_or_null(name));
                }
                RelationKind::HasMany | RelationKind::BelongsToMany => {
                    stages.push(lookup(&from, relation.local_key(), relation.foreign_key(), name));
                    projection.insert(name, live_items(name));
                }
                RelationKind::ManyToMany {
                    join_collection,
                    local_join_key,
                    foreign_join_key,
                } => {
                    stages.push(lookup(
                        join_collection,
                        relation.local_key(),
                        local_join_key,
                        name,
                    ));
                    stages.push(unwind(name));
                    stages.push(lookup(
                        &from,
                        &format!("{name}.{foreign_join_key}"),
                        relation.foreign_key(),
                        name,
                    ));
                    stages.push(unwind(name));

                    let mut group = doc! {
                        ID_FIELD: format!("${ID_FIELD}"),
                        name: { "$push": format!("${name}") },
                    };
                    // The projection so far holds the declared fields and every
                    // relation resolved before this one.
                    let carried = projection
                        .keys()
                        .map(String::as_str)
                        .filter(|key| *key != ID_FIELD && *key != name);
                    for key in carried {
                        group.insert(key, doc! { "$first": format!("${key}") });
                    }
                    stages.push(doc! { "$group": group });
                    projection.insert(name, live_items(name));
                }
                RelationKind::HasManyLocally => {
                    stages.push(doc! {
                        "$lookup": {
                            "from": from,
                            "let": { "local_ids": format!("${}", relation.local_key()) },
                            "pipeline": [
                                { "$match": { "$expr": {
                                    "$in": [
                                        format!("${}", relation.foreign_key()),
                                        { "$ifNull": ["$$local_ids", []] },
                                    ]
                                } } }
                            ],
                            "as": name,
                        }
                    });
                    projection.insert(name, live_items(name));
                }
            }
            resolved.push(name);
        }

        stages.push(doc! { "$project": projection });

        if !self.relation_filter.is_empty() {
            stages.push(doc! { "$match": self.relation_filter });
        }

        if let Some(sort) = sort {
            stages.push(doc! { "$sort": sort });
        }

        debug!(
            collection = self.schema.collection_name(),
            relations = ?resolved,
            stages = stages.len(),
            "synthesized pipeline"
        );

        Pipeline { stages }
    }
}

fn lookup(from: &str, local_field: &str, foreign_field: &str, name: &str) -> Document {
    doc! {
        "$lookup": {
            "from": from,
            "localField": local_field,
            "foreignField": foreign_field,
            "as": name,
        }
    }
}

fn unwind(name: &str) -> Document {
    doc! {
        "$unwind": {
            "path": format!("${name}"),
            "preserveNullAndEmptyArrays": true,
        }
    }
}

/// First element of a looked-up array, or null.
fn first_or_null(name: &str) -> Bson {
    Bson::Document(doc! {
        "$ifNull": [{ "$arrayElemAt": [format!("${name}"), 0] }, Bson::Null]
    })
}

/// Looked-up items that are not soft-deleted.
fn live_items(name: &str) -> Bson {
    Bson::Document(doc! {
        "$filter": {
            "input": format!("${name}"),
            "as": "item",
            "cond": {
                "$eq": [{ "$ifNull": [format!("$$item.{DELETED_AT}"), Bson::Null] }, Bson::Null]
            },
        }
    })
}
