use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tablegate_contracts::{Attributes, ErrorKind, OwnershipCondition, Record};
use tokio::sync::RwLock;

use crate::StorageEngine;
use crate::throughput::ThroughputLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    DuplicateKey,
    ItemNotFound,
    ConditionalCheckFailed,
    ProvisionedThroughputExceeded,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::DuplicateKey => write!(f, "an item with this key already exists"),
            MemoryError::ItemNotFound => write!(f, "no item with this key"),
            MemoryError::ConditionalCheckFailed => write!(f, "the conditional request failed"),
            MemoryError::ProvisionedThroughputExceeded => {
                write!(f, "provisioned throughput exceeded")
            }
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<String, Record>,
    /// Secondary index: owner id to the ids it owns.
    owner_index: HashMap<String, BTreeSet<String>>,
}

impl Tables {
    fn index(&mut self, record: &Record) {
        self.owner_index
            .entry(record.owner_id.clone())
            .or_default()
            .insert(record.id.clone());
    }

    fn unindex(&mut self, record: &Record) {
        if let Some(ids) = self.owner_index.get_mut(&record.owner_id) {
            ids.remove(&record.id);
            if ids.is_empty() {
                self.owner_index.remove(&record.owner_id);
            }
        }
    }

    fn owned(&self, id: &str, condition: &OwnershipCondition) -> Result<&Record, MemoryError> {
        let record = self.records.get(id).ok_or(MemoryError::ItemNotFound)?;
        if !condition.holds_for(record) {
            return Err(MemoryError::ConditionalCheckFailed);
        }
        Ok(record)
    }

    fn guarded(
        &mut self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> Result<&mut Record, MemoryError> {
        let record = self.records.get_mut(id).ok_or(MemoryError::ItemNotFound)?;
        if !condition.holds_for(record) {
            return Err(MemoryError::ConditionalCheckFailed);
        }
        Ok(record)
    }
}

/// In-process engine with a primary table keyed by id and an owner index.
/// Every operation holds a single lock guard, so conditional writes are atomic.
#[derive(Clone, Debug)]
pub struct MemoryEngine {
    tables: Arc<RwLock<Tables>>,
    throughput: ThroughputLimiter,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_throughput(0, Duration::from_secs(1))
    }

    /// Rejects calls beyond `limit` per `window` as throttled. Zero disables the budget.
    pub fn with_throughput(limit: u32, window: Duration) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            throughput: ThroughputLimiter::new(limit, window),
        }
    }

    fn admit(&self) -> Result<(), MemoryError> {
        if self.throughput.admit() {
            Ok(())
        } else {
            Err(MemoryError::ProvisionedThroughputExceeded)
        }
    }
}

impl StorageEngine for MemoryEngine {
    type Error = MemoryError;

    async fn put_item(&self, record: Record) -> Result<(), Self::Error> {
        self.admit()?;
        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.id) {
            return Err(MemoryError::DuplicateKey);
        }
        tables.index(&record);
        tables.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Record>, Self::Error> {
        self.admit()?;
        let tables = self.tables.read().await;
        Ok(tables.records.get(id).cloned())
    }

    async fn scan(&self) -> Result<Vec<Record>, Self::Error> {
        self.admit()?;
        let tables = self.tables.read().await;
        Ok(tables.records.values().cloned().collect())
    }

    async fn query_by_owner(&self, owner_id: &str) -> Result<Vec<Record>, Self::Error> {
        self.admit()?;
        let tables = self.tables.read().await;
        let Some(ids) = tables.owner_index.get(owner_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| tables.records.get(id))
            .cloned()
            .collect())
    }

    async fn update_if_owner(
        &self,
        id: &str,
        attributes: Attributes,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.admit()?;
        let mut tables = self.tables.write().await;
        let record = tables.guarded(id, condition)?;
        record.attributes.extend(attributes);
        Ok(())
    }

    async fn delete_if_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.admit()?;
        let mut tables = self.tables.write().await;
        tables.owned(id, condition)?;
        if let Some(record) = tables.records.remove(id) {
            tables.unindex(&record);
        }
        Ok(())
    }

    async fn check_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.admit()?;
        let tables = self.tables.read().await;
        tables.owned(id, condition).map(|_| ())
    }

    fn classify(error: &Self::Error) -> ErrorKind {
        match error {
            MemoryError::DuplicateKey | MemoryError::ConditionalCheckFailed => {
                ErrorKind::ConditionFailed
            }
            MemoryError::ItemNotFound => ErrorKind::NotFound,
            MemoryError::ProvisionedThroughputExceeded => ErrorKind::Throttled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablegate_contracts::AttrValue;

    fn pet(id: &str, owner: &str, name: &str) -> Record {
        Record {
            id: id.to_string(),
            owner_id: owner.to_string(),
            created_at: "2026-10-16T00:00:00Z".to_string(),
            attributes: Attributes::from([
                ("name".to_string(), AttrValue::from(name)),
                ("age".to_string(), AttrValue::from(2)),
            ]),
        }
    }

    async fn seeded() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.put_item(pet("A", "P1", "Fluffy")).await.unwrap();
        engine.put_item(pet("B", "P2", "Rex")).await.unwrap();
        engine.put_item(pet("C", "P1", "Tom")).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn put_rejects_duplicate_keys() {
        let engine = seeded().await;
        let err = engine.put_item(pet("A", "P2", "Other")).await.unwrap_err();
        assert_eq!(err, MemoryError::DuplicateKey);
        assert_eq!(MemoryEngine::classify(&err), ErrorKind::ConditionFailed);

        let stored = engine.get_item("A").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "P1");
    }

    #[tokio::test]
    async fn query_returns_exactly_the_owner_subset() {
        let engine = seeded().await;
        let mine = engine.query_by_owner("P1").await.unwrap();
        let ids = mine.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["A", "C"]);
        assert!(engine.query_by_owner("nobody").await.unwrap().is_empty());
        assert_eq!(engine.scan().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn update_merges_fields_only_for_owner() {
        let engine = seeded().await;
        let changes = Attributes::from([("name".to_string(), AttrValue::from("Whiskers"))]);

        let err = engine
            .update_if_owner("A", changes.clone(), &OwnershipCondition::new("P2"))
            .await
            .unwrap_err();
        assert_eq!(err, MemoryError::ConditionalCheckFailed);
        let untouched = engine.get_item("A").await.unwrap().unwrap();
        assert_eq!(untouched.attributes["name"], AttrValue::from("Fluffy"));

        engine
            .update_if_owner("A", changes, &OwnershipCondition::new("P1"))
            .await
            .unwrap();
        let updated = engine.get_item("A").await.unwrap().unwrap();
        assert_eq!(updated.attributes["name"], AttrValue::from("Whiskers"));
        assert_eq!(updated.attributes["age"], AttrValue::from(2));
        assert_eq!(updated.owner_id, "P1");
    }

    #[tokio::test]
    async fn missing_items_are_not_found_for_guarded_operations() {
        let engine = seeded().await;
        let owner = OwnershipCondition::new("P1");
        assert_eq!(
            engine
                .update_if_owner("missing", Attributes::new(), &owner)
                .await
                .unwrap_err(),
            MemoryError::ItemNotFound
        );
        assert_eq!(
            engine.delete_if_owner("missing", &owner).await.unwrap_err(),
            MemoryError::ItemNotFound
        );
        assert_eq!(
            engine.check_owner("missing", &owner).await.unwrap_err(),
            MemoryError::ItemNotFound
        );
        assert_eq!(
            MemoryEngine::classify(&MemoryError::ItemNotFound),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn delete_keeps_owner_index_consistent() {
        let engine = seeded().await;
        assert_eq!(
            engine
                .delete_if_owner("A", &OwnershipCondition::new("P2"))
                .await
                .unwrap_err(),
            MemoryError::ConditionalCheckFailed
        );
        engine
            .delete_if_owner("A", &OwnershipCondition::new("P1"))
            .await
            .unwrap();

        assert!(engine.get_item("A").await.unwrap().is_none());
        let mine = engine.query_by_owner("P1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "C");
    }

    #[tokio::test]
    async fn throughput_budget_is_shared_across_clones() {
        let engine = MemoryEngine::with_throughput(2, Duration::from_secs(60));
        let clone = engine.clone();
        engine.scan().await.unwrap();
        clone.scan().await.unwrap();
        let err = engine.get_item("A").await.unwrap_err();
        assert_eq!(err, MemoryError::ProvisionedThroughputExceeded);
        assert_eq!(MemoryEngine::classify(&err), ErrorKind::Throttled);
    }

    #[tokio::test]
    async fn check_owner_does_not_block_concurrent_readers() {
        let engine = seeded().await;
        let reader = engine.tables.read().await;

        let checked = tokio::time::timeout(
            Duration::from_secs(1),
            engine.check_owner("B", &OwnershipCondition::new("P2")),
        )
        .await
        .expect("check_owner should only need a read guard");
        assert!(checked.is_ok());
        drop(reader);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_owner_deletes_succeed_exactly_once() {
        let engine = seeded().await;

        let handles = (0..16)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .delete_if_owner("A", &OwnershipCondition::new("P1"))
                        .await
                })
            })
            .collect::<Vec<_>>();

        let mut deleted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => deleted += 1,
                Err(err) => assert_eq!(err, MemoryError::ItemNotFound),
            }
        }
        assert_eq!(deleted, 1);
        assert!(engine.query_by_owner("P1").await.unwrap().iter().all(|r| r.id != "A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn owner_update_racing_owner_delete_never_reports_a_denial() {
        for _ in 0..32 {
            let engine = seeded().await;
            let owner = OwnershipCondition::new("P1");

            let update = {
                let engine = engine.clone();
                let owner = owner.clone();
                tokio::spawn(async move {
                    let changes =
                        Attributes::from([("name".to_string(), AttrValue::from("Whiskers"))]);
                    engine.update_if_owner("A", changes, &owner).await
                })
            };
            let delete = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.delete_if_owner("A", &owner).await })
            };

            assert_eq!(delete.await.unwrap(), Ok(()));
            match update.await.unwrap() {
                Ok(()) | Err(MemoryError::ItemNotFound) => {}
                Err(other) => panic!("owner update raced into {other:?}"),
            }
            assert!(engine.get_item("A").await.unwrap().is_none());
        }
    }
}
