use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use serde_json::Value;

use crate::{
    config::DbSettings,
    db::{DbHandle, TableDdl},
    error::StoreError,
    models::PreferenceEntry,
};

static DDL: TableDdl = TableDdl {
    table: "insight.chat_preferences",
    create: &[r#"
        CREATE TABLE IF NOT EXISTS insight.chat_preferences (
            user_id TEXT PRIMARY KEY,
            preferences JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#],
    patches: &[],
};

const UPSERT: &str = r#"
    INSERT INTO insight.chat_preferences (user_id, preferences, created_at, updated_at)
    VALUES ($1, $2, NOW(), NOW())
    ON CONFLICT (user_id) DO UPDATE SET
        preferences = EXCLUDED.preferences,
        updated_at = NOW()
    RETURNING user_id, preferences, created_at, updated_at"#;

/// Per-user chat preferences as a proper keyed store rather than ambient
/// process state, so the same dual-mode lifecycle and tests apply.
pub struct PreferenceStore {
    db: DbHandle,
    mem: RwLock<HashMap<String, PreferenceEntry>>,
}

impl PreferenceStore {
    pub fn new(settings: DbSettings) -> Self {
        Self {
            db: DbHandle::new(settings, &DDL),
            mem: RwLock::new(HashMap::new()),
        }
    }

    pub fn configured(&self) -> bool {
        self.db.configured()
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.db.init().await.map(|_| ())
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PreferenceEntry>, StoreError> {
        if !self.db.configured() {
            return Ok(self.read().get(user_id.trim()).cloned());
        }

        let client = self.db.client().await?;
        let row = self
            .db
            .query_opt(
                &client,
                "SELECT user_id, preferences, created_at, updated_at \
                 FROM insight.chat_preferences WHERE user_id = $1",
                &[&user_id.trim()],
            )
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    pub async fn set(&self, user_id: &str, preferences: Value) -> Result<PreferenceEntry, StoreError> {
        let key = user_id.trim().to_string();
        if key.is_empty() {
            return Err(StoreError::InvalidRecord("user id must not be empty".into()));
        }

        if !self.db.configured() {
            let mut mem = self.write();
            let now = Utc::now();
            let existing = mem.get(&key);
            let entry = PreferenceEntry {
                user_id: key.clone(),
                preferences,
                created_at: existing.map(|e| e.created_at).unwrap_or(now),
                updated_at: existing.map(|e| e.updated_at.max(now)).unwrap_or(now),
            };
            mem.insert(key, entry.clone());
            return Ok(entry);
        }

        let client = self.db.client().await?;
        let row = self
            .db
            .query_one(&client, UPSERT, &[&key, &preferences])
            .await?;
        row_to_entry(&row)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PreferenceEntry>> {
        self.mem.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PreferenceEntry>> {
        self.mem.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_entry(row: &tokio_postgres::Row) -> Result<PreferenceEntry, StoreError> {
    Ok(PreferenceEntry {
        user_id: row.try_get("user_id")?,
        preferences: row.try_get("preferences")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips_per_user() {
        let store = PreferenceStore::new(DbSettings::default());
        assert!(store.get("alex").await.unwrap().is_none());

        store
            .set("alex", json!({ "chartStyle": "dark" }))
            .await
            .unwrap();
        store
            .set("sam", json!({ "chartStyle": "light" }))
            .await
            .unwrap();

        let alex = store.get("alex").await.unwrap().unwrap();
        assert_eq!(alex.preferences["chartStyle"], "dark");
        let sam = store.get("sam").await.unwrap().unwrap();
        assert_eq!(sam.preferences["chartStyle"], "light");
    }

    #[tokio::test]
    async fn second_set_keeps_created_at() {
        let store = PreferenceStore::new(DbSettings::default());
        let first = store.set("alex", json!({ "a": 1 })).await.unwrap();
        let second = store.set("alex", json!({ "a": 2 })).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.preferences["a"], 2);
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected() {
        let store = PreferenceStore::new(DbSettings::default());
        let err = store.set("  ", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
