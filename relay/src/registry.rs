use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    error::{RelayError, RelayResult},
    migration::{Migration, MigrationId},
};

/// Every migration this relay knows about, indexed by id.
///
/// The database is the source of truth. The registry is filled once at startup from it and then only grows as
/// migrations are created.
#[derive(Default)]
pub struct Registry {
    migrations: DashMap<MigrationId, Arc<Migration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, migration: Arc<Migration>) {
        self.migrations.insert(migration.id(), migration);
    }

    pub fn get(&self, id: MigrationId) -> RelayResult<Arc<Migration>> {
        self.migrations
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or_else(|| RelayError::not_found("migration", id))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn migrations(&self) -> Vec<Arc<Migration>> {
        self.migrations.iter().map(|m| m.value().clone()).collect()
    }
}
