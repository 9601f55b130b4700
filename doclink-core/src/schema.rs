//! Declarative record kinds: field registry, relations and per-kind policy.
//!
//! A [`Schema`] describes one record kind (one collection). It is assembled with
//! [`Schema::builder`] and is read-only afterwards, so it can be shared across
//! concurrent calls without locking.
//!
//! # Example
//!
//! ```ignore
//! use doclink::schema::{FieldType, Model, Schema};
//! use doclink::relation::{CascadeOp, CascadePolicy, Relation};
//!
//! struct Order;
//! struct Item;
//!
//! impl Model for Order {
//!     fn schema() -> Schema {
//!         Schema::builder("orders")
//!             .field("customer", FieldType::String)
//!             .relation(
//!                 Relation::has_many::<Item>("items", "_id", "order_id")
//!                     .cascade(CascadePolicy::of([CascadeOp::Create, CascadeOp::Update])),
//!             )
//!             .build()
//!     }
//! }
//! ```

use std::collections::HashMap;

use crate::{
    hooks::{HookPoint, HookSet},
    relation::Relation,
};

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";
/// Creation timestamp, set once on insert.
pub const CREATED_AT: &str = "created_at";
/// Modification timestamp, refreshed on every persisted mutation.
pub const UPDATED_AT: &str = "updated_at";
/// Soft-delete marker. Its presence means the record is logically removed.
pub const DELETED_AT: &str = "deleted_at";

/// Semantic type tag of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    IsoDate,
    Integer,
    Double,
    Object,
    Array,
    ObjectId,
    ObjectIdList,
    Boolean,
}

impl FieldType {
    /// Human readable name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::IsoDate => "ISODate",
            FieldType::Integer => "Integer",
            FieldType::Double => "Double",
            FieldType::Object => "Object",
            FieldType::Array => "Array",
            FieldType::ObjectId => "ObjectId",
            FieldType::ObjectIdList => "ObjectIdList",
            FieldType::Boolean => "Boolean",
        }
    }
}

/// A single `(name, type)` pair of a record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type }
    }
}

/// Ordered field declarations with constant time lookup by name.
///
/// The identifier and the three timestamp fields are always present, appended
/// after the declared fields unless the declaration already names them.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
}

impl FieldRegistry {
    pub fn new(declared: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        let mut registry = Self::default();

        registry.push(FieldDescriptor::new(ID_FIELD, FieldType::ObjectId));
        for descriptor in declared {
            registry.push(descriptor);
        }
        for name in [CREATED_AT, UPDATED_AT, DELETED_AT] {
            registry.push(FieldDescriptor::new(name, FieldType::IsoDate));
        }

        registry
    }

    fn push(&mut self, descriptor: FieldDescriptor) {
        match self.index.get(&descriptor.name) {
            // A later declaration of the same name overrides the type, keeping its slot.
            Some(&slot) => self.fields[slot].field_type = descriptor.field_type,
            None => {
                self.index.insert(descriptor.name.clone(), self.fields.len());
                self.fields.push(descriptor);
            }
        }
    }

    /// Returns the declared type of `name`, if any.
    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.index
            .get(name)
            .map(|&slot| self.fields[slot].field_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    pub fn as_slice(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Compile-time declaration of a record kind.
///
/// Relations refer to their target through `M::schema`, so kinds that point at
/// each other can be declared without building an infinite structure.
pub trait Model: Send + Sync + 'static {
    fn schema() -> Schema;
}

/// Immutable description of one record kind.
#[derive(Debug, Clone)]
pub struct Schema {
    collection_name: String,
    fields: FieldRegistry,
    relations: Vec<Relation>,
    protected_fields: Vec<String>,
    soft_deletes: bool,
    hooks: HookSet,
}

impl Schema {
    pub fn builder(collection_name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(collection_name)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// The full field list, implicit fields included.
    pub fn describe(&self) -> &[FieldDescriptor] {
        self.fields.as_slice()
    }

    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name)
    }

    /// Relations sorted by name.
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations
            .binary_search_by(|relation| relation.name().cmp(name))
            .ok()
            .map(|slot| &self.relations[slot])
    }

    pub fn protected_fields(&self) -> &[String] {
        &self.protected_fields
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected_fields.iter().any(|field| field == name)
    }

    pub fn soft_deletes(&self) -> bool {
        self.soft_deletes
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }
}

/// Builder for [`Schema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    collection_name: String,
    fields: Vec<FieldDescriptor>,
    relations: Vec<Relation>,
    protected_fields: Vec<String>,
    soft_deletes: bool,
    hooks: HookSet,
}

impl SchemaBuilder {
    pub fn new(collection_name: impl Into<String>) -> Self {
        Self {
            collection_name: collection_name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            protected_fields: Vec::new(),
            soft_deletes: false,
            hooks: HookSet::default(),
        }
    }

    /// Declares a field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor::new(name, field_type));
        self
    }

    /// Declares a relation. A relation with the same name replaces the previous one.
    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations
            .retain(|existing| existing.name() != relation.name());
        self.relations.push(relation);
        self
    }

    /// Marks a field as protected: stripped from every read unless whitelisted.
    pub fn protected(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.protected_fields.contains(&name) {
            self.protected_fields.push(name);
        }
        self
    }

    /// Enables soft deletes for this kind.
    pub fn soft_deletes(mut self, enabled: bool) -> Self {
        self.soft_deletes = enabled;
        self
    }

    /// Enables a lifecycle hook point.
    pub fn hook(mut self, point: HookPoint) -> Self {
        self.hooks.insert(point);
        self
    }

    pub fn build(self) -> Schema {
        let mut relations = self.relations;
        relations.sort_by(|a, b| a.name().cmp(b.name()));

        Schema {
            collection_name: self.collection_name,
            fields: FieldRegistry::new(self.fields),
            relations,
            protected_fields: self.protected_fields,
            soft_deletes: self.soft_deletes,
            hooks: self.hooks,
        }
    }
}
