//! Relation declarations between record kinds.
//!
//! Each relation names a target kind, the keys that link the two collections and
//! the operations that cascade from parent to children. The kind is a closed
//! enum so the pipeline synthesizer and the persistence orchestrator handle every
//! topology exhaustively.

use crate::schema::{Model, Schema};

/// Write operation a cascade policy can be evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Create,
    Update,
    Delete,
}

/// The set of operations under which a parent write propagates to related records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadePolicy {
    create: bool,
    update: bool,
    delete: bool,
}

impl CascadePolicy {
    /// No cascade at all.
    pub const NONE: CascadePolicy = CascadePolicy {
        create: false,
        update: false,
        delete: false,
    };

    /// Cascades every operation.
    pub const ALL: CascadePolicy = CascadePolicy {
        create: true,
        update: true,
        delete: true,
    };

    pub fn of(ops: impl IntoIterator<Item = CascadeOp>) -> Self {
        ops.into_iter().collect()
    }

    pub fn with(mut self, op: CascadeOp) -> Self {
        match op {
            CascadeOp::Create => self.create = true,
            CascadeOp::Update => self.update = true,
            CascadeOp::Delete => self.delete = true,
        }
        self
    }

    pub fn allows(&self, op: CascadeOp) -> bool {
        match op {
            CascadeOp::Create => self.create,
            CascadeOp::Update => self.update,
            CascadeOp::Delete => self.delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl FromIterator<CascadeOp> for CascadePolicy {
    fn from_iter<I: IntoIterator<Item = CascadeOp>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CascadePolicy::NONE, CascadePolicy::with)
    }
}

/// Topology of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// The target holds a key pointing back at the parent; at most one target.
    HasOne,
    /// The target holds a key pointing back at the parent; any number of targets.
    HasMany,
    /// The parent holds a key pointing at a single target.
    BelongsTo,
    /// Like [`RelationKind::HasMany`], seen from the owned side of a shared parent.
    BelongsToMany,
    /// Parent and targets are linked through rows of a join collection.
    ManyToMany {
        join_collection: String,
        /// Join row field holding the parent's local key.
        local_join_key: String,
        /// Join row field holding the target's foreign key.
        foreign_join_key: String,
    },
    /// The parent stores an array of target identifiers in its local key.
    HasManyLocally,
}

impl RelationKind {
    /// Whether resolved values are arrays rather than a single record.
    pub fn is_list(&self) -> bool {
        match self {
            RelationKind::HasOne | RelationKind::BelongsTo => false,
            RelationKind::HasMany
            | RelationKind::BelongsToMany
            | RelationKind::ManyToMany { .. }
            | RelationKind::HasManyLocally => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelationKind::HasOne => "hasOne",
            RelationKind::HasMany => "hasMany",
            RelationKind::BelongsTo => "belongsTo",
            RelationKind::BelongsToMany => "belongsToMany",
            RelationKind::ManyToMany { .. } => "manyToMany",
            RelationKind::HasManyLocally => "hasManyLocally",
        }
    }
}

/// A named link from one record kind to another.
#[derive(Debug, Clone)]
pub struct Relation {
    name: String,
    kind: RelationKind,
    local_key: String,
    foreign_key: String,
    related: fn() -> Schema,
    cascade: CascadePolicy,
    soft_deletes: bool,
}

impl Relation {
    pub fn new(
        name: impl Into<String>,
        kind: RelationKind,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
        related: fn() -> Schema,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            local_key: local_key.into(),
            foreign_key: foreign_key.into(),
            related,
            cascade: CascadePolicy::NONE,
            soft_deletes: false,
        }
    }

    pub fn has_one<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::HasOne, local_key, foreign_key, M::schema)
    }

    pub fn has_many<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::HasMany, local_key, foreign_key, M::schema)
    }

    pub fn belongs_to<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::BelongsTo, local_key, foreign_key, M::schema)
    }

    pub fn belongs_to_many<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::BelongsToMany, local_key, foreign_key, M::schema)
    }

    pub fn has_many_locally<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationKind::HasManyLocally, local_key, foreign_key, M::schema)
    }

    pub fn many_to_many<M: Model>(
        name: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
        join_collection: impl Into<String>,
        local_join_key: impl Into<String>,
        foreign_join_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::ManyToMany {
                join_collection: join_collection.into(),
                local_join_key: local_join_key.into(),
                foreign_join_key: foreign_join_key.into(),
            },
            local_key,
            foreign_key,
            M::schema,
        )
    }

    /// Sets the operations that cascade through this relation.
    pub fn cascade(mut self, policy: CascadePolicy) -> Self {
        self.cascade = policy;
        self
    }

    /// Whether cascaded deletes mark related records instead of removing them.
    pub fn soft_deletes(mut self, enabled: bool) -> Self {
        self.soft_deletes = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RelationKind {
        &self.kind
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn cascade_policy(&self) -> CascadePolicy {
        self.cascade
    }

    pub fn uses_soft_deletes(&self) -> bool {
        self.soft_deletes
    }

    /// Builds the related kind's schema.
    pub fn related_schema(&self) -> Schema {
        (self.related)()
    }
}
