use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::DbSettings,
    db::{DbHandle, TableDdl},
    error::StoreError,
    models::{SemanticModelDraft, SemanticModelEntry},
    normalize::normalize_key,
};

static DDL: TableDdl = TableDdl {
    table: "insight.semantic_models",
    create: &[r#"
        CREATE TABLE IF NOT EXISTS insight.semantic_models (
            id UUID PRIMARY KEY,
            dataset TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#],
    patches: &[
        "ALTER TABLE insight.semantic_models ADD COLUMN IF NOT EXISTS description TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE insight.semantic_models ADD COLUMN IF NOT EXISTS definition JSONB NOT NULL DEFAULT '{}'",
    ],
};

const COLUMNS: &str = "id, dataset, name, description, definition, created_at, updated_at";

const UPSERT: &str = r#"
    INSERT INTO insight.semantic_models
        (id, dataset, name, description, definition, created_at, updated_at)
    VALUES
        ($1, $2, $3, $4, $5, NOW(), NOW())
    ON CONFLICT (dataset) DO UPDATE SET
        name = EXCLUDED.name,
        description = EXCLUDED.description,
        definition = EXCLUDED.definition,
        updated_at = NOW()
    RETURNING id, dataset, name, description, definition, created_at, updated_at"#;

#[derive(Default)]
struct MemCatalogue {
    records: HashMap<Uuid, SemanticModelEntry>,
    by_dataset: HashMap<String, Uuid>,
    by_norm: HashMap<String, Uuid>,
}

impl MemCatalogue {
    fn apply(&mut self, draft: &SemanticModelDraft) -> Result<SemanticModelEntry, StoreError> {
        let dataset = draft.dataset.trim().to_string();
        let now = Utc::now();

        let existing = self
            .by_dataset
            .get(&dataset)
            .and_then(|id| self.records.get(id))
            .cloned();
        // Matches the relational backend, which rejects a reused id as a
        // primary-key violation.
        if existing.is_none() {
            if let Some(id) = draft.id {
                if self.records.contains_key(&id) {
                    return Err(StoreError::InvalidRecord(format!(
                        "id {id} already belongs to another semantic model"
                    )));
                }
            }
        }
        let id = existing
            .as_ref()
            .map(|e| e.id)
            .or(draft.id)
            .unwrap_or_else(Uuid::new_v4);

        let entry = SemanticModelEntry {
            id,
            dataset: dataset.clone(),
            name: draft.display_name(),
            description: draft.description.clone().unwrap_or_default(),
            definition: draft.definition.clone(),
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: existing
                .as_ref()
                .map(|e| e.updated_at.max(now))
                .unwrap_or(now),
        };

        self.by_norm.insert(normalize_key(&dataset), id);
        self.by_dataset.insert(dataset, id);
        self.records.insert(id, entry.clone());
        Ok(entry)
    }

    fn resolve(&self, key: &str) -> Option<&SemanticModelEntry> {
        let trimmed = key.trim();
        if let Ok(id) = Uuid::parse_str(trimmed) {
            if let Some(entry) = self.records.get(&id) {
                return Some(entry);
            }
        }
        if let Some(id) = self.by_dataset.get(trimmed) {
            return self.records.get(id);
        }
        self.by_norm
            .get(&normalize_key(trimmed))
            .and_then(|id| self.records.get(id))
    }
}

/// Dual-mode semantic model catalogue, keyed by dataset name.
pub struct SemanticStore {
    db: DbHandle,
    seeds: Vec<SemanticModelDraft>,
    mem: RwLock<MemCatalogue>,
}

impl SemanticStore {
    pub fn new(settings: DbSettings, seeds: Vec<SemanticModelDraft>) -> Self {
        let mut mem = MemCatalogue::default();
        if !settings.configured() {
            for draft in &seeds {
                if let Err(err) = mem.apply(draft) {
                    warn!(dataset = %draft.dataset, error = %err, "skipping invalid seed semantic model");
                }
            }
        }
        Self {
            db: DbHandle::new(settings, &DDL),
            seeds,
            mem: RwLock::new(mem),
        }
    }

    pub fn configured(&self) -> bool {
        self.db.configured()
    }

    /// Idempotent; the seed pass only runs on the call that establishes the
    /// pool.
    pub async fn init(&self) -> Result<(), StoreError> {
        if !self.db.init().await? {
            return Ok(());
        }

        let mut client = self.db.client().await?;
        let tx = client.transaction().await?;
        for draft in &self.seeds {
            validate(draft)?;
            let id = draft.id.unwrap_or_else(Uuid::new_v4);
            tx.execute(
                UPSERT,
                &[
                    &id,
                    &draft.dataset.trim(),
                    &draft.display_name(),
                    &draft.description.clone().unwrap_or_default(),
                    &draft.definition,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_all(&self) -> Result<Vec<SemanticModelEntry>, StoreError> {
        if !self.db.configured() {
            let mem = self.read();
            let mut entries: Vec<_> = mem.records.values().cloned().collect();
            entries.sort_by(|a, b| {
                (a.name.to_lowercase(), &a.dataset).cmp(&(b.name.to_lowercase(), &b.dataset))
            });
            return Ok(entries);
        }

        let client = self.db.client().await?;
        let rows = self
            .db
            .query(
                &client,
                &format!(
                    "SELECT {COLUMNS} FROM insight.semantic_models ORDER BY name ASC, dataset ASC"
                ),
                &[],
            )
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Resolve by id, then exact dataset name, then normalized dataset name.
    pub async fn get(&self, key: &str) -> Result<Option<SemanticModelEntry>, StoreError> {
        if !self.db.configured() {
            return Ok(self.read().resolve(key).cloned());
        }

        let client = self.db.client().await?;
        let trimmed = key.trim();

        if let Ok(id) = Uuid::parse_str(trimmed) {
            let row = self
                .db
                .query_opt(
                    &client,
                    &format!("SELECT {COLUMNS} FROM insight.semantic_models WHERE id = $1"),
                    &[&id],
                )
                .await?;
            if let Some(row) = row {
                return row_to_entry(&row).map(Some);
            }
        }

        let row = self
            .db
            .query_opt(
                &client,
                &format!("SELECT {COLUMNS} FROM insight.semantic_models WHERE dataset = $1"),
                &[&trimmed],
            )
            .await?;
        if let Some(row) = row {
            return row_to_entry(&row).map(Some);
        }

        // Distinct datasets can collapse to the same normalized key; take the
        // first by display order rather than erroring on the multi-row result.
        let row = self
            .db
            .query_opt(
                &client,
                &format!(
                    "SELECT {COLUMNS} FROM insight.semantic_models \
                     WHERE lower(translate(btrim(dataset), ' -.', '___')) = $1 \
                     ORDER BY name ASC, dataset ASC LIMIT 1"
                ),
                &[&normalize_key(trimmed)],
            )
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    pub async fn upsert(&self, draft: SemanticModelDraft) -> Result<SemanticModelEntry, StoreError> {
        validate(&draft)?;

        if !self.db.configured() {
            return self.write().apply(&draft);
        }

        let client = self.db.client().await?;
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let row = self
            .db
            .query_one(
                &client,
                UPSERT,
                &[
                    &id,
                    &draft.dataset.trim(),
                    &draft.display_name(),
                    &draft.description.clone().unwrap_or_default(),
                    &draft.definition,
                ],
            )
            .await?;
        row_to_entry(&row)
    }

    fn read(&self) -> RwLockReadGuard<'_, MemCatalogue> {
        self.mem.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemCatalogue> {
        self.mem.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate(draft: &SemanticModelDraft) -> Result<(), StoreError> {
    if draft.dataset.trim().is_empty() {
        return Err(StoreError::InvalidRecord(
            "semantic model dataset must not be empty".into(),
        ));
    }
    Ok(())
}

fn row_to_entry(row: &tokio_postgres::Row) -> Result<SemanticModelEntry, StoreError> {
    Ok(SemanticModelEntry {
        id: row.try_get("id")?,
        dataset: row.try_get("dataset")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        definition: row.try_get("definition")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::seed;

    fn empty() -> SemanticStore {
        SemanticStore::new(DbSettings::default(), Vec::new())
    }

    #[tokio::test]
    async fn upsert_twice_replaces_definition_without_duplicating() {
        let store = empty();
        let first = store
            .upsert(SemanticModelDraft {
                id: None,
                dataset: "churn".into(),
                name: Some("Churn Model".into()),
                description: None,
                definition: json!({ "measures": [{ "name": "churn_rate" }] }),
            })
            .await
            .unwrap();

        let second = store
            .upsert(SemanticModelDraft {
                id: None,
                dataset: "churn".into(),
                name: Some("Churn Model".into()),
                description: None,
                definition: json!({ "measures": [{ "name": "churn_rate_v2" }] }),
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].definition,
            json!({ "measures": [{ "name": "churn_rate_v2" }] })
        );
    }

    #[tokio::test]
    async fn lookup_by_id_dataset_and_normalized_name_agree() {
        let store = SemanticStore::new(DbSettings::default(), seed::example_semantic_models());
        let by_dataset = store.get("sales_data").await.unwrap().unwrap();
        let by_id = store
            .get(&by_dataset.id.to_string())
            .await
            .unwrap()
            .unwrap();
        let by_norm = store.get("Sales-Data").await.unwrap().unwrap();
        assert_eq!(by_dataset.id, by_id.id);
        assert_eq!(by_dataset.id, by_norm.id);
    }

    #[tokio::test]
    async fn missing_and_malformed_keys_return_none() {
        let store = SemanticStore::new(DbSettings::default(), seed::example_semantic_models());
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.get("1234-not-a-uuid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn colliding_normalized_datasets_still_resolve() {
        let store = empty();
        // "a-b" and "a.b" stay distinct natural keys but normalize alike.
        for dataset in ["a-b", "a.b"] {
            store
                .upsert(SemanticModelDraft {
                    id: None,
                    dataset: dataset.into(),
                    name: None,
                    description: None,
                    definition: json!({}),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
        let hit = store.get("a_b").await.unwrap().unwrap();
        assert!(hit.dataset == "a-b" || hit.dataset == "a.b");
    }

    #[tokio::test]
    async fn id_belonging_to_another_dataset_is_rejected() {
        let store = empty();
        let first = store
            .upsert(SemanticModelDraft {
                id: None,
                dataset: "orders".into(),
                name: None,
                description: None,
                definition: json!({}),
            })
            .await
            .unwrap();

        let err = store
            .upsert(SemanticModelDraft {
                id: Some(first.id),
                dataset: "customers".into(),
                name: None,
                description: None,
                definition: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert_eq!(store.fetch_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_dataset_is_rejected() {
        let store = empty();
        let err = store
            .upsert(SemanticModelDraft {
                id: None,
                dataset: "".into(),
                name: None,
                description: None,
                definition: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
