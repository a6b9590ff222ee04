//! SQLite inventory store.

use super::{InventoryStore, StoreError};
use async_trait::async_trait;
use mesh_types::{FoodItemRecord, PersonRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// SQLite-backed inventory.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FoodItemRow {
    name: String,
    quantity: f64,
    unit: String,
    calories_per_unit: f64,
    expiry_date: Option<String>,
    notes: Option<String>,
    updated_at: Option<i64>,
}

impl From<FoodItemRow> for FoodItemRecord {
    fn from(row: FoodItemRow) -> Self {
        Self {
            name: row.name,
            quantity: row.quantity,
            unit: row.unit,
            calories_per_unit: row.calories_per_unit,
            expiry_date: row.expiry_date,
            notes: row.notes,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PersonRow {
    name: String,
    daily_consumption: f64,
    dietary_restrictions: Option<String>,
    notes: Option<String>,
    updated_at: Option<i64>,
}

impl From<PersonRow> for PersonRecord {
    fn from(row: PersonRow) -> Self {
        Self {
            name: row.name,
            daily_consumption: row.daily_consumption,
            dietary_restrictions: row.dietary_restrictions,
            notes: row.notes,
            updated_at: row.updated_at,
        }
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A second connection would open a different, empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS food_items (
                name TEXT PRIMARY KEY NOT NULL,
                quantity REAL NOT NULL,
                unit TEXT NOT NULL DEFAULT '',
                calories_per_unit REAL NOT NULL DEFAULT 0,
                expiry_date TEXT,
                notes TEXT,
                updated_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS people (
                name TEXT PRIMARY KEY NOT NULL,
                daily_consumption REAL NOT NULL,
                dietary_restrictions TEXT,
                notes TEXT,
                updated_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn list_food_items(&self) -> Result<Vec<FoodItemRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FoodItemRow>(
            r#"
            SELECT name, quantity, unit, calories_per_unit, expiry_date, notes, updated_at
            FROM food_items
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_people(&self) -> Result<Vec<PersonRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PersonRow>(
            r#"
            SELECT name, daily_consumption, dietary_restrictions, notes, updated_at
            FROM people
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_food_item_by_name(
        &self,
        name: &str,
    ) -> Result<Option<FoodItemRecord>, StoreError> {
        let row = sqlx::query_as::<_, FoodItemRow>(
            r#"
            SELECT name, quantity, unit, calories_per_unit, expiry_date, notes, updated_at
            FROM food_items
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn upsert_food_item(&self, item: FoodItemRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO food_items
                (name, quantity, unit, calories_per_unit, expiry_date, notes, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
                quantity = excluded.quantity,
                unit = excluded.unit,
                calories_per_unit = excluded.calories_per_unit,
                expiry_date = excluded.expiry_date,
                notes = excluded.notes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.name)
        .bind(item.quantity)
        .bind(&item.unit)
        .bind(item.calories_per_unit)
        .bind(&item.expiry_date)
        .bind(&item.notes)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_person_by_name(&self, name: &str) -> Result<Option<PersonRecord>, StoreError> {
        let row = sqlx::query_as::<_, PersonRow>(
            r#"
            SELECT name, daily_consumption, dietary_restrictions, notes, updated_at
            FROM people
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn upsert_person(&self, person: PersonRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO people
                (name, daily_consumption, dietary_restrictions, notes, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                daily_consumption = excluded.daily_consumption,
                dietary_restrictions = excluded.dietary_restrictions,
                notes = excluded.notes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&person.name)
        .bind(person.daily_consumption)
        .bind(&person.dietary_restrictions)
        .bind(&person.notes)
        .bind(person.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rice(quantity: f64, updated_at: Option<i64>) -> FoodItemRecord {
        FoodItemRecord {
            name: "Rice".into(),
            quantity,
            unit: "kg".into(),
            calories_per_unit: 3600.0,
            expiry_date: Some("2027-01-01".into()),
            notes: None,
            updated_at,
        }
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.list_food_items().await.unwrap().is_empty());
        assert!(store.list_people().await.unwrap().is_empty());
        assert!(store.find_food_item_by_name("Rice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn food_item_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_food_item(rice(5.0, Some(100))).await.unwrap();

        let found = store.find_food_item_by_name("Rice").await.unwrap().unwrap();
        assert_eq!(found, rice(5.0, Some(100)));
    }

    #[tokio::test]
    async fn upsert_overwrites_same_name() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_food_item(rice(5.0, Some(100))).await.unwrap();
        store.upsert_food_item(rice(2.0, None)).await.unwrap();

        let all = store.list_food_items().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].quantity, 2.0);
        assert_eq!(all[0].updated_at, None);
    }

    #[tokio::test]
    async fn people_ordered_by_name() {
        let store = SqliteStore::in_memory().await.unwrap();
        for name in ["Zoe", "Ada", "Max"] {
            store
                .upsert_person(PersonRecord {
                    name: name.into(),
                    daily_consumption: 2000.0,
                    dietary_restrictions: None,
                    notes: None,
                    updated_at: Some(1),
                })
                .await
                .unwrap();
        }
        let names: Vec<String> = store
            .list_people()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Ada", "Max", "Zoe"]);
    }

    #[tokio::test]
    async fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("prepper.db");
        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.upsert_food_item(rice(1.0, Some(1))).await.unwrap();
        }
        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.list_food_items().await.unwrap().len(), 1);
    }
}
