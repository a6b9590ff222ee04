//! Inventory storage.
//!
//! The mesh engine only needs list, find-by-name and upsert over the two
//! record kinds. Records are keyed by `name`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use mesh_types::{FoodItemRecord, PersonRecord};

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store cannot take requests right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be converted to a record.
    #[error("stored record malformed: {0}")]
    Serialization(String),
}

/// CRUD access to the local inventory.
#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    /// All food items, ordered by name.
    async fn list_food_items(&self) -> Result<Vec<FoodItemRecord>, StoreError>;

    /// All people, ordered by name.
    async fn list_people(&self) -> Result<Vec<PersonRecord>, StoreError>;

    /// Look up a food item by name.
    async fn find_food_item_by_name(&self, name: &str)
        -> Result<Option<FoodItemRecord>, StoreError>;

    /// Insert a food item, or replace the one with the same name.
    async fn upsert_food_item(&self, item: FoodItemRecord) -> Result<(), StoreError>;

    /// Look up a person by name.
    async fn find_person_by_name(&self, name: &str) -> Result<Option<PersonRecord>, StoreError>;

    /// Insert a person, or replace the one with the same name.
    async fn upsert_person(&self, person: PersonRecord) -> Result<(), StoreError>;
}
