//! In-memory inventory store for tests.
//!
//! Allows seeding records and injecting write failures.

use super::{InventoryStore, StoreError};
use async_trait::async_trait;
use mesh_types::{FoodItemRecord, PersonRecord};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory store. Clones share the same data.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    food_items: BTreeMap<String, FoodItemRecord>,
    people: BTreeMap<String, PersonRecord>,
    failing_names: HashSet<String>,
    unavailable: bool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a food item directly, bypassing failure injection.
    pub fn insert_food_item(&self, item: FoodItemRecord) {
        self.lock().food_items.insert(item.name.clone(), item);
    }

    /// Seed a person directly, bypassing failure injection.
    pub fn insert_person(&self, person: PersonRecord) {
        self.lock().people.insert(person.name.clone(), person);
    }

    /// Make every write of a record with this name fail.
    pub fn fail_writes_for(&self, name: &str) {
        self.lock().failing_names.insert(name.to_string());
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of stored food items.
    pub fn food_item_count(&self) -> usize {
        self.lock().food_items.len()
    }

    /// Number of stored people.
    pub fn person_count(&self) -> usize {
        self.lock().people.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(inner: &MemoryStoreInner) -> Result<(), StoreError> {
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn check_writable(inner: &MemoryStoreInner, name: &str) -> Result<(), StoreError> {
        Self::check_available(inner)?;
        if inner.failing_names.contains(name) {
            return Err(StoreError::Unavailable(format!("write rejected for {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn list_food_items(&self) -> Result<Vec<FoodItemRecord>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.food_items.values().cloned().collect())
    }

    async fn list_people(&self) -> Result<Vec<PersonRecord>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.people.values().cloned().collect())
    }

    async fn find_food_item_by_name(
        &self,
        name: &str,
    ) -> Result<Option<FoodItemRecord>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.food_items.get(name).cloned())
    }

    async fn upsert_food_item(&self, item: FoodItemRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_writable(&inner, &item.name)?;
        inner.food_items.insert(item.name.clone(), item);
        Ok(())
    }

    async fn find_person_by_name(&self, name: &str) -> Result<Option<PersonRecord>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.people.get(name).cloned())
    }

    async fn upsert_person(&self, person: PersonRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_writable(&inner, &person.name)?;
        inner.people.insert(person.name.clone(), person);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beans(quantity: f64) -> FoodItemRecord {
        FoodItemRecord {
            name: "Beans".into(),
            quantity,
            unit: "cans".into(),
            calories_per_unit: 250.0,
            expiry_date: None,
            notes: None,
            updated_at: Some(1),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_name() {
        let store = MemoryStore::new();
        store.upsert_food_item(beans(1.0)).await.unwrap();
        store.upsert_food_item(beans(3.0)).await.unwrap();

        assert_eq!(store.food_item_count(), 1);
        let found = store.find_food_item_by_name("Beans").await.unwrap().unwrap();
        assert_eq!(found.quantity, 3.0);
    }

    #[tokio::test]
    async fn clones_share_data() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.insert_food_item(beans(1.0));
        assert_eq!(clone.list_food_items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let store = MemoryStore::new();
        store.fail_writes_for("Beans");
        assert!(matches!(
            store.upsert_food_item(beans(1.0)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.food_item_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_reads() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.list_people().await.is_err());
        store.set_unavailable(false);
        assert!(store.list_people().await.unwrap().is_empty());
    }
}
