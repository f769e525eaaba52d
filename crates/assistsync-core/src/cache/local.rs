use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::models::{Entity, PendingMutation};

use super::store::{KvStore, StoreError};

const ENTITY_PREFIX: &str = "entity/";
const QUEUE_PREFIX: &str = "queue/";
const FAILED_PREFIX: &str = "failed/";

/// Typed view over a `KvStore`: entities, per-key mutation queues and
/// per-key failed mutations, each stored as one JSON record.
#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KvStore>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.kv.get(name)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: name.to_string(),
                source,
            })
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(data)?;
        self.kv.put(name, &bytes)
    }

    /// Store a list, removing the record entirely when the list is empty.
    fn save_list<T: Serialize>(&self, name: &str, items: &[T]) -> Result<(), StoreError> {
        if items.is_empty() {
            self.kv.delete(name)
        } else {
            self.save(name, items)
        }
    }

    fn keys_under(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .kv
            .keys(prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
            .collect())
    }

    // ===== Entities =====

    pub fn get(&self, key: &str) -> Result<Option<Entity>, StoreError> {
        self.load(&format!("{}{}", ENTITY_PREFIX, key))
    }

    pub fn put(&self, entity: &Entity) -> Result<(), StoreError> {
        self.save(&format!("{}{}", ENTITY_PREFIX, entity.key), entity)
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.delete(&format!("{}{}", ENTITY_PREFIX, key))
    }

    /// Keys of entities carrying unsynced local changes, plus any key that
    /// still has queued mutations.
    pub fn list_dirty(&self) -> Result<Vec<String>, StoreError> {
        let mut dirty = self.keys_under(QUEUE_PREFIX)?;
        for key in self.keys_under(ENTITY_PREFIX)? {
            if dirty.contains(&key) {
                continue;
            }
            match self.get(&key) {
                Ok(Some(entity)) if entity.dirty => dirty.push(key),
                Ok(_) => {}
                Err(e) => debug!(key = %key, error = %e, "Skipping unreadable entity"),
            }
        }
        dirty.sort();
        Ok(dirty)
    }

    // ===== Pending mutations =====

    pub fn queue(&self, key: &str) -> Result<Vec<PendingMutation>, StoreError> {
        Ok(self
            .load(&format!("{}{}", QUEUE_PREFIX, key))?
            .unwrap_or_default())
    }

    pub fn save_queue(&self, key: &str, queue: &[PendingMutation]) -> Result<(), StoreError> {
        self.save_list(&format!("{}{}", QUEUE_PREFIX, key), queue)
    }

    pub fn max_mutation_id(&self) -> Result<u64, StoreError> {
        let mut max = 0;
        for prefix in [QUEUE_PREFIX, FAILED_PREFIX] {
            for key in self.keys_under(prefix)? {
                let list: Vec<PendingMutation> =
                    self.load(&format!("{}{}", prefix, key))?.unwrap_or_default();
                max = list.iter().map(|m| m.id).fold(max, u64::max);
            }
        }
        Ok(max)
    }

    // ===== Failed mutations =====

    pub fn failed(&self, key: &str) -> Result<Vec<PendingMutation>, StoreError> {
        Ok(self
            .load(&format!("{}{}", FAILED_PREFIX, key))?
            .unwrap_or_default())
    }

    pub fn save_failed(&self, key: &str, failed: &[PendingMutation]) -> Result<(), StoreError> {
        self.save_list(&format!("{}{}", FAILED_PREFIX, key), failed)
    }

    /// Remove every record this adapter owns.
    pub fn clear(&self) -> Result<(), StoreError> {
        for prefix in [ENTITY_PREFIX, QUEUE_PREFIX, FAILED_PREFIX] {
            for name in self.kv.keys(prefix)? {
                self.kv.delete(&name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::models::MutationKind;
    use serde_json::json;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_entity_round_trip_and_delete() {
        let local = store();
        let entity = Entity::from_remote("task-1", json!({"title": "Buy milk"}), Some("v1".into()));
        local.put(&entity).unwrap();
        assert_eq!(local.get("task-1").unwrap(), Some(entity));

        local.delete("task-1").unwrap();
        assert_eq!(local.get("task-1").unwrap(), None);
    }

    #[test]
    fn test_list_dirty() {
        let local = store();
        let clean = Entity::from_remote("clean", json!(1), None);
        let mut dirty = Entity::from_remote("dirty", json!(2), None);
        dirty.dirty = true;
        local.put(&clean).unwrap();
        local.put(&dirty).unwrap();
        local
            .save_queue("queued", &[PendingMutation::new(1, "queued", MutationKind::Delete, json!(null), None)])
            .unwrap();

        assert_eq!(local.list_dirty().unwrap(), vec!["dirty", "queued"]);
    }

    #[test]
    fn test_empty_queue_removes_record() {
        let local = store();
        let mutation = PendingMutation::new(7, "k", MutationKind::Update, json!({}), None);
        local.save_queue("k", &[mutation]).unwrap();
        assert_eq!(local.queue("k").unwrap().len(), 1);
        assert_eq!(local.max_mutation_id().unwrap(), 7);

        local.save_queue("k", &[]).unwrap();
        assert!(local.queue("k").unwrap().is_empty());
        assert!(local.list_dirty().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_reports_key() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("entity/broken", b"not json").unwrap();
        let local = LocalStore::new(kv);
        let err = local.get("broken").unwrap_err();
        assert!(err.to_string().contains("entity/broken"));
    }

    #[test]
    fn test_clear() {
        let local = store();
        local.put(&Entity::from_remote("a", json!(1), None)).unwrap();
        local
            .save_failed("a", &[PendingMutation::new(1, "a", MutationKind::Create, json!(1), None)])
            .unwrap();
        local.clear().unwrap();
        assert!(local.get("a").unwrap().is_none());
        assert!(local.failed("a").unwrap().is_empty());
    }
}
