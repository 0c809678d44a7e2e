//! StateStore — redb-backed persistence for tierscale.
//!
//! Provides typed operations over scaling policies, storage bindings and
//! autoscaler checkpoints. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: serde::Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Insert or replace the scaling policy of a service.
    pub fn put_policy(&self, service: &str, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_json(POLICIES, service, policy)?;
        debug!(%service, "policy stored");
        Ok(())
    }

    pub fn get_policy(&self, service: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get_json(POLICIES, service)
    }

    /// List all `(service, policy)` pairs.
    pub fn list_policies(&self) -> StateResult<Vec<(String, ScalingPolicy)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let policy: ScalingPolicy =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), policy));
        }
        Ok(results)
    }

    // ── Storage bindings ───────────────────────────────────────────

    /// Record the binding of an ordinal to a volume.
    pub fn put_binding(&self, binding: &StorageBinding) -> StateResult<()> {
        let key = binding.table_key();
        self.put_json(BINDINGS, &key, binding)?;
        debug!(%key, binding = %binding.binding_id, "storage binding stored");
        Ok(())
    }

    pub fn get_binding(&self, service: &str, ordinal: u32) -> StateResult<Option<StorageBinding>> {
        self.get_json(BINDINGS, &binding_key(service, ordinal))
    }

    /// List all bindings of a service, ordered by ordinal.
    pub fn list_bindings_for_service(&self, service: &str) -> StateResult<Vec<StorageBinding>> {
        let prefix = format!("{service}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let binding: StorageBinding =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(binding);
            }
        }
        Ok(results)
    }

    // ── Checkpoints ────────────────────────────────────────────────

    pub fn put_checkpoint(&self, checkpoint: &ControllerCheckpoint) -> StateResult<()> {
        self.put_json(CHECKPOINTS, &checkpoint.tier, checkpoint)
    }

    pub fn get_checkpoint(&self, tier: &str) -> StateResult<Option<ControllerCheckpoint>> {
        self.get_json(CHECKPOINTS, tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> ScalingPolicy {
        ScalingPolicy {
            target_utilization: 0.5,
            min_replicas: 2,
            max_replicas: 10,
            scale_up_step_limit: 4,
            scale_down_step_limit: 1,
            stabilization_window: 3,
        }
    }

    fn test_binding(service: &str, ordinal: u32) -> StorageBinding {
        StorageBinding {
            service: service.to_string(),
            ordinal,
            binding_id: format!("vol-{service}-{ordinal}"),
            bound_at: 1000,
        }
    }

    // ── Policies ───────────────────────────────────────────────────

    #[test]
    fn policy_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_policy("web", &test_policy()).unwrap();

        assert_eq!(store.get_policy("web").unwrap(), Some(test_policy()));
        assert!(store.get_policy("nope").unwrap().is_none());
    }

    #[test]
    fn policy_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut policy = test_policy();
        store.put_policy("web", &policy).unwrap();

        policy.max_replicas = 20;
        store.put_policy("web", &policy).unwrap();

        let all = store.list_policies().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "web");
        assert_eq!(all[0].1.max_replicas, 20);
    }

    // ── Bindings ───────────────────────────────────────────────────

    #[test]
    fn bindings_listed_per_service_in_ordinal_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_binding(&test_binding("db", 10)).unwrap();
        store.put_binding(&test_binding("db", 2)).unwrap();
        store.put_binding(&test_binding("db2", 0)).unwrap();

        let db = store.list_bindings_for_service("db").unwrap();
        let ordinals: Vec<u32> = db.iter().map(|b| b.ordinal).collect();
        assert_eq!(ordinals, vec![2, 10]);

        assert_eq!(store.list_bindings_for_service("db2").unwrap().len(), 1);
    }

    #[test]
    fn binding_get_by_ordinal() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_binding(&test_binding("db", 1)).unwrap();

        let b = store.get_binding("db", 1).unwrap().unwrap();
        assert_eq!(b.binding_id, "vol-db-1");
        assert!(store.get_binding("db", 0).unwrap().is_none());
    }

    // ── Checkpoints ────────────────────────────────────────────────

    #[test]
    fn checkpoint_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let cp = ControllerCheckpoint {
            tier: "web".to_string(),
            last_commanded: 4,
            updated_at: 1000,
        };
        store.put_checkpoint(&cp).unwrap();
        assert_eq!(store.get_checkpoint("web").unwrap(), Some(cp));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn bindings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_binding(&test_binding("db", 0)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let binding = store.get_binding("db", 0).unwrap();
        assert_eq!(binding.map(|b| b.binding_id), Some("vol-db-0".to_string()));
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_policies().unwrap().is_empty());
        assert!(store.list_bindings_for_service("any").unwrap().is_empty());
        assert!(store.get_checkpoint("any").unwrap().is_none());
    }
}
