//! StateStore — redb-backed status of compositions, distributions and
//! node-tier isolates.
//!
//! Values are JSON-serialized into redb's `&[u8]` columns. The store has an
//! on-disk and an in-memory backend (the latter for tests). Every write is
//! its own transaction, so the store is safe to share across tasks.

use std::path::Path;
use std::sync::Arc;

use flock_core::{Component, Composition, Isolate, TopDistribution};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Hand-off point for computed top distributions.
///
/// Exposed remotely so that a distribution computed by one composer can be
/// loaded by another process.
pub trait DistributionStore: Send + Sync {
    fn store(&self, uid: &str, content: &TopDistribution) -> StateResult<()>;
    fn load(&self, uid: &str) -> StateResult<Option<TopDistribution>>;
    /// Returns true if the uid was stored.
    fn remove(&self, uid: &str) -> StateResult<bool>;
    fn list_uids(&self) -> StateResult<Vec<String>>;
}

#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(COMPOSITIONS).map_err(map_err!(Table))?;
        txn.open_table(DISTRIBUTIONS).map_err(map_err!(Table))?;
        txn.open_table(ISOLATES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Compositions ───────────────────────────────────────────────

    /// Store a composition. A name already in use is a conflict.
    pub fn put_composition(&self, composition: &Composition) -> StateResult<()> {
        let name = composition.name();
        let value = serde_json::to_vec(composition).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COMPOSITIONS).map_err(map_err!(Table))?;
            if table.get(name).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(name.to_string()));
            }
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, "composition stored");
        Ok(())
    }

    pub fn get_composition(&self, name: &str) -> StateResult<Option<Composition>> {
        self.get_json(COMPOSITIONS, name)
    }

    pub fn list_compositions(&self) -> StateResult<Vec<Composition>> {
        self.scan_json(COMPOSITIONS, "")
    }

    pub fn remove_composition(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove_key(COMPOSITIONS, name)?;
        debug!(%name, existed, "composition removed");
        Ok(existed)
    }

    // ── Isolates ───────────────────────────────────────────────────

    /// Insert or update a node-tier isolate.
    pub fn put_isolate(&self, isolate: &Isolate) -> StateResult<()> {
        let key = isolate_key(&isolate.node, &isolate.name);
        self.put_json(ISOLATES, &key, isolate)
    }

    pub fn get_isolate(&self, node: &str, name: &str) -> StateResult<Option<Isolate>> {
        self.get_json(ISOLATES, &isolate_key(node, name))
    }

    /// Isolates known on a node, ordered by name.
    pub fn list_isolates(&self, node: &str) -> StateResult<Vec<Isolate>> {
        self.scan_json(ISOLATES, &format!("{node}/"))
    }

    pub fn remove_isolate(&self, node: &str, name: &str) -> StateResult<bool> {
        self.remove_key(ISOLATES, &isolate_key(node, name))
    }

    /// Components sharing an isolate with `component` on `node`.
    pub fn neighbours(&self, node: &str, component: &str) -> StateResult<Vec<Component>> {
        let isolates = self.list_isolates(node)?;
        Ok(isolates
            .into_iter()
            .find(|isolate| isolate.components.iter().any(|c| c.name == component))
            .map(|isolate| {
                isolate
                    .components
                    .into_iter()
                    .filter(|c| c.name != component)
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── JSON table helpers ─────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn keys(&self, table: JsonTable) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

impl DistributionStore for StateStore {
    fn store(&self, uid: &str, content: &TopDistribution) -> StateResult<()> {
        self.put_json(DISTRIBUTIONS, uid, content)?;
        debug!(%uid, name = %content.name, "top distribution stored");
        Ok(())
    }

    fn load(&self, uid: &str) -> StateResult<Option<TopDistribution>> {
        self.get_json(DISTRIBUTIONS, uid)
    }

    fn remove(&self, uid: &str) -> StateResult<bool> {
        let existed = self.remove_key(DISTRIBUTIONS, uid)?;
        debug!(%uid, existed, "top distribution removed");
        Ok(existed)
    }

    fn list_uids(&self) -> StateResult<Vec<String>> {
        self.keys(DISTRIBUTIONS)
    }
}

fn isolate_key(node: &str, name: &str) -> String {
    format!("{node}/{name}")
}
