//! Inventory merge.
//!
//! Applies an inbound [`InventorySnapshot`] to the local store one record at
//! a time using last-write-wins by name. A record that cannot be decoded,
//! carries a bad timestamp or fails to store is counted and skipped; the
//! rest of the snapshot still applies.
//!
//! Lookup and write of a record happen under one lock, so concurrent merges
//! from different peers cannot overwrite a newer record with an older one.

use std::sync::Arc;

use mesh_core::{normalize_updated_at, resolve, Resolution, TimestampError};
use mesh_types::{FoodItemRecord, InventorySnapshot, PersonRecord};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{InventoryStore, StoreError};

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Records inserted because no local record had the name.
    pub created: usize,
    /// Local records replaced by strictly newer ones.
    pub updated: usize,
    /// Records where the local copy won.
    pub skipped: usize,
    /// Records that could not be applied.
    pub failed: usize,
}

impl MergeSummary {
    /// Total records processed.
    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed
    }

    /// Whether the local store changed.
    pub fn changed(&self) -> bool {
        self.created + self.updated > 0
    }

    fn count(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Create => self.created += 1,
            Resolution::Replace => self.updated += 1,
            Resolution::Keep => self.skipped += 1,
        }
    }
}

/// Why a single record was not applied.
#[derive(Debug, Error)]
pub enum MergeRecordError {
    /// The record does not have the expected shape.
    #[error("undecodable record: {0}")]
    Decode(#[from] serde_json::Error),

    /// `updatedAt` is present but unusable.
    #[error("invalid updatedAt: {0}")]
    Timestamp(#[from] TimestampError),

    /// The store rejected the lookup or write.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Merges inbound snapshots into an [`InventoryStore`].
#[derive(Debug)]
pub struct MergeEngine<S: InventoryStore> {
    store: Arc<S>,
    // Held across find and upsert of one record
    write_lock: Mutex<()>,
}

impl<S: InventoryStore> MergeEngine<S> {
    /// Create an engine writing to `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Merge every record of `snapshot`. Never fails as a whole.
    pub async fn merge(&self, snapshot: &InventorySnapshot) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for raw in &snapshot.food_items {
            match self.merge_food_item(raw.clone()).await {
                Ok(resolution) => summary.count(resolution),
                Err(e) => {
                    tracing::warn!(name = record_name(raw), error = %e, "food item not merged");
                    summary.failed += 1;
                }
            }
        }

        for raw in &snapshot.people {
            match self.merge_person(raw.clone()).await {
                Ok(resolution) => summary.count(resolution),
                Err(e) => {
                    tracing::warn!(name = record_name(raw), error = %e, "person not merged");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn merge_food_item(&self, mut raw: Value) -> Result<Resolution, MergeRecordError> {
        let updated_at = normalize_updated_at(&mut raw)?;
        let incoming: FoodItemRecord = serde_json::from_value(raw)?;

        let _write = self.write_lock.lock().await;
        let existing = self.store.find_food_item_by_name(&incoming.name).await?;
        let resolution = resolve(existing.map(|local| local.updated_at), updated_at);
        if resolution != Resolution::Keep {
            self.store.upsert_food_item(incoming).await?;
        }
        Ok(resolution)
    }

    async fn merge_person(&self, mut raw: Value) -> Result<Resolution, MergeRecordError> {
        let updated_at = normalize_updated_at(&mut raw)?;
        let mut incoming: PersonRecord = serde_json::from_value(raw)?;

        let _write = self.write_lock.lock().await;
        let existing = self.store.find_person_by_name(&incoming.name).await?;
        let resolution = resolve(
            existing.as_ref().map(|local| local.updated_at),
            updated_at,
        );
        if resolution == Resolution::Keep {
            return Ok(resolution);
        }

        // Blank incoming notes never erase local ones
        if incoming.notes.as_deref().map_or(true, str::is_empty) {
            if let Some(local_notes) = existing.and_then(|local| local.notes) {
                incoming.notes = Some(local_notes);
            }
        }
        self.store.upsert_person(incoming).await?;
        Ok(resolution)
    }
}

fn record_name(raw: &Value) -> &str {
    raw.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn engine() -> (MergeEngine<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        (MergeEngine::new(Arc::new(store.clone())), store)
    }

    fn snapshot(food_items: Vec<Value>, people: Vec<Value>) -> InventorySnapshot {
        InventorySnapshot {
            food_items,
            people,
            timestamp: Some(1),
        }
    }

    fn rice(quantity: f64, updated_at: Option<i64>) -> FoodItemRecord {
        FoodItemRecord {
            name: "Rice".into(),
            quantity,
            unit: "kg".into(),
            calories_per_unit: 3600.0,
            expiry_date: None,
            notes: None,
            updated_at,
        }
    }

    async fn stored_rice(store: &MemoryStore) -> FoodItemRecord {
        store.find_food_item_by_name("Rice").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn empty_store_creates_record() {
        let (engine, store) = engine();
        let summary = engine
            .merge(&snapshot(
                vec![json!({"name": "Rice", "quantity": 5, "updatedAt": 100})],
                vec![],
            ))
            .await;

        assert_eq!(summary.created, 1);
        assert_eq!(store.food_item_count(), 1);
        let item = stored_rice(&store).await;
        assert_eq!(item.quantity, 5.0);
        assert_eq!(item.updated_at, Some(100));
    }

    #[tokio::test]
    async fn older_incoming_is_skipped() {
        let (engine, store) = engine();
        store.insert_food_item(rice(5.0, Some(100)));

        let summary = engine
            .merge(&snapshot(
                vec![json!({"name": "Rice", "quantity": 2, "updatedAt": 50})],
                vec![],
            ))
            .await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(stored_rice(&store).await, rice(5.0, Some(100)));
    }

    #[tokio::test]
    async fn newer_incoming_replaces() {
        let (engine, store) = engine();
        store.insert_food_item(rice(5.0, Some(100)));

        let summary = engine
            .merge(&snapshot(
                vec![json!({"name": "Rice", "quantity": 2, "unit": "kg", "updatedAt": 150})],
                vec![],
            ))
            .await;

        assert_eq!(summary.updated, 1);
        let item = stored_rice(&store).await;
        assert_eq!(item.quantity, 2.0);
        assert_eq!(item.updated_at, Some(150));
    }

    #[tokio::test]
    async fn timestamp_rules_for_unset_values() {
        let (engine, store) = engine();
        store.insert_food_item(rice(5.0, None));

        // Incoming without a timestamp never replaces
        let summary = engine
            .merge(&snapshot(vec![json!({"name": "Rice", "quantity": 1})], vec![]))
            .await;
        assert_eq!(summary.skipped, 1);

        // Local without a timestamp loses
        let summary = engine
            .merge(&snapshot(
                vec![json!({"name": "Rice", "quantity": 9, "updatedAt": 1})],
                vec![],
            ))
            .await;
        assert_eq!(summary.updated, 1);
        assert_eq!(stored_rice(&store).await.quantity, 9.0);
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let (engine, store) = engine();
        let incoming = snapshot(
            vec![
                json!({"name": "Rice", "quantity": 5, "updatedAt": 100}),
                json!({"name": "Beans", "quantity": 12, "updatedAt": 100}),
            ],
            vec![json!({"name": "Ada", "dailyConsumption": 2000, "updatedAt": 100})],
        );

        let first = engine.merge(&incoming).await;
        let second = engine.merge(&incoming).await;

        assert_eq!(first.created, 3);
        assert_eq!(second.skipped, 3);
        assert!(!second.changed());
        assert_eq!(store.food_item_count(), 2);
        assert_eq!(store.person_count(), 1);
    }

    #[tokio::test]
    async fn result_is_independent_of_order() {
        let older = json!({"name": "Rice", "quantity": 1, "updatedAt": 100});
        let newer = json!({"name": "Rice", "quantity": 7, "updatedAt": 200});

        let (forward, forward_store) = engine();
        forward.merge(&snapshot(vec![older.clone()], vec![])).await;
        forward.merge(&snapshot(vec![newer.clone()], vec![])).await;

        let (backward, backward_store) = engine();
        backward.merge(&snapshot(vec![newer], vec![])).await;
        backward.merge(&snapshot(vec![older], vec![])).await;

        assert_eq!(
            stored_rice(&forward_store).await,
            stored_rice(&backward_store).await
        );
        assert_eq!(stored_rice(&forward_store).await.quantity, 7.0);
    }

    #[tokio::test]
    async fn rfc3339_timestamp_is_accepted() {
        let (engine, store) = engine();
        store.insert_food_item(rice(5.0, Some(100)));

        let summary = engine
            .merge(&snapshot(
                vec![json!({"name": "Rice", "quantity": 3, "updatedAt": "2024-05-01T12:00:00Z"})],
                vec![],
            ))
            .await;

        assert_eq!(summary.updated, 1);
        assert_eq!(stored_rice(&store).await.updated_at, Some(1_714_564_800_000));
    }

    #[tokio::test]
    async fn malformed_record_fails_alone() {
        let (engine, store) = engine();
        let summary = engine
            .merge(&snapshot(
                vec![
                    json!({"name": "Rice", "quantity": 5, "updatedAt": "not a date"}),
                    json!({"name": "Beans"}),
                    json!("just a string"),
                    json!({"name": "Oats", "quantity": 3, "updatedAt": 10}),
                ],
                vec![],
            ))
            .await;

        assert_eq!(
            summary,
            MergeSummary {
                created: 1,
                updated: 0,
                skipped: 0,
                failed: 3,
            }
        );
        assert_eq!(store.food_item_count(), 1);
    }

    #[tokio::test]
    async fn store_failure_counts_and_continues() {
        let (engine, store) = engine();
        store.fail_writes_for("Rice");

        let summary = engine
            .merge(&snapshot(
                vec![
                    json!({"name": "Rice", "quantity": 5, "updatedAt": 1}),
                    json!({"name": "Oats", "quantity": 3, "updatedAt": 1}),
                ],
                vec![],
            ))
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.total(), 2);
    }

    /// Suspends after every lookup so concurrent merges interleave.
    struct YieldingStore(MemoryStore);

    #[async_trait::async_trait]
    impl InventoryStore for YieldingStore {
        async fn list_food_items(&self) -> Result<Vec<FoodItemRecord>, StoreError> {
            self.0.list_food_items().await
        }

        async fn list_people(&self) -> Result<Vec<PersonRecord>, StoreError> {
            self.0.list_people().await
        }

        async fn find_food_item_by_name(
            &self,
            name: &str,
        ) -> Result<Option<FoodItemRecord>, StoreError> {
            let found = self.0.find_food_item_by_name(name).await;
            tokio::task::yield_now().await;
            found
        }

        async fn upsert_food_item(&self, item: FoodItemRecord) -> Result<(), StoreError> {
            self.0.upsert_food_item(item).await
        }

        async fn find_person_by_name(&self, name: &str) -> Result<Option<PersonRecord>, StoreError> {
            let found = self.0.find_person_by_name(name).await;
            tokio::task::yield_now().await;
            found
        }

        async fn upsert_person(&self, person: PersonRecord) -> Result<(), StoreError> {
            self.0.upsert_person(person).await
        }
    }

    #[tokio::test]
    async fn concurrent_merges_keep_newest() {
        let store = MemoryStore::new();
        store.insert_food_item(rice(5.0, Some(100)));
        let engine = MergeEngine::new(Arc::new(YieldingStore(store.clone())));

        let newest = snapshot(
            vec![json!({"name": "Rice", "quantity": 3, "updatedAt": 300})],
            vec![],
        );
        let newer = snapshot(
            vec![json!({"name": "Rice", "quantity": 2, "updatedAt": 200})],
            vec![],
        );
        let (first, second) = tokio::join!(engine.merge(&newest), engine.merge(&newer));

        assert_eq!(first.updated, 1);
        assert_eq!(second.skipped, 1);
        let item = stored_rice(&store).await;
        assert_eq!(item.updated_at, Some(300));
        assert_eq!(item.quantity, 3.0);
    }

    #[tokio::test]
    async fn person_keeps_local_notes_when_incoming_has_none() {
        let (engine, store) = engine();
        store.insert_person(PersonRecord {
            name: "Ada".into(),
            daily_consumption: 2000.0,
            dietary_restrictions: None,
            notes: Some("allergic to peanuts".into()),
            updated_at: Some(100),
        });

        let summary = engine
            .merge(&snapshot(
                vec![],
                vec![json!({"name": "Ada", "dailyConsumption": 2200, "notes": "", "updatedAt": 200})],
            ))
            .await;

        assert_eq!(summary.updated, 1);
        let person = store.find_person_by_name("Ada").await.unwrap().unwrap();
        assert_eq!(person.daily_consumption, 2200.0);
        assert_eq!(person.notes.as_deref(), Some("allergic to peanuts"));
    }

    #[tokio::test]
    async fn person_notes_replaced_when_incoming_has_some() {
        let (engine, store) = engine();
        store.insert_person(PersonRecord {
            name: "Ada".into(),
            daily_consumption: 2000.0,
            dietary_restrictions: None,
            notes: Some("old".into()),
            updated_at: Some(100),
        });

        engine
            .merge(&snapshot(
                vec![],
                vec![json!({"name": "Ada", "dailyConsumption": 2000, "notes": "new", "updatedAt": 200})],
            ))
            .await;

        let person = store.find_person_by_name("Ada").await.unwrap().unwrap();
        assert_eq!(person.notes.as_deref(), Some("new"));
    }
}
