//! Lifecycle hooks invoked around writes.
//!
//! Hooks are attached to a [`Collection`](crate::collection::Collection) with
//! `with_hooks` and only run for the points enabled in the record kind's
//! [`Schema`](crate::schema::Schema). Every method has a no-op default, so an
//! implementation overrides just the points it cares about. An error returned
//! by a hook aborts the surrounding operation.

use std::collections::HashSet;

use async_trait::async_trait;
use bson::oid::ObjectId;

use crate::{coerce::Record, error::DocumentStoreResult};

/// The six points at which a hook can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreCreate,
    PostCreate,
    PreUpdate,
    PostUpdate,
    PreDelete,
    PostDelete,
}

/// Hook points enabled for a record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSet(HashSet<HookPoint>);

impl HookSet {
    pub fn insert(&mut self, point: HookPoint) {
        self.0.insert(point);
    }

    pub fn contains(&self, point: HookPoint) -> bool {
        self.0.contains(&point)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<HookPoint> for HookSet {
    fn from_iter<I: IntoIterator<Item = HookPoint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Callbacks receiving identifiers and wire representations of records.
#[async_trait]
pub trait ModelHooks: Send + Sync {
    async fn pre_create(&self, _record: &Record) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn post_create(&self, _record: &Record) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn pre_update(&self, _record: &Record) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn post_update(&self, _record: &Record) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn pre_delete(&self, _id: &ObjectId) -> DocumentStoreResult<()> {
        Ok(())
    }

    /// `record` is the soft-deleted record, or `None` after a hard delete.
    async fn post_delete(
        &self,
        _id: &ObjectId,
        _record: Option<&Record>,
        _soft: bool,
    ) -> DocumentStoreResult<()> {
        Ok(())
    }
}
