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
    models::{finalize_aliases, ModelCatalogueEntry, ModelDraft},
    normalize::normalize_key,
};

static DDL: TableDdl = TableDdl {
    table: "insight.model_catalogue",
    create: &[r#"
        CREATE TABLE IF NOT EXISTS insight.model_catalogue (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#],
    // Columns added after the initial release; replayed on drift.
    patches: &[
        "ALTER TABLE insight.model_catalogue ADD COLUMN IF NOT EXISTS source_path TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE insight.model_catalogue ADD COLUMN IF NOT EXISTS sql_text TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE insight.model_catalogue ADD COLUMN IF NOT EXISTS aliases TEXT[] NOT NULL DEFAULT '{}'",
    ],
};

const COLUMNS: &str = "id, slug, name, description, source_path, sql_text, aliases, created_at, updated_at";

// The alias array is finalized in SQL so the id-derived alias always matches
// the surviving row's id, not the id of a draft that lost the conflict.
const UPSERT: &str = r#"
    INSERT INTO insight.model_catalogue
        (id, slug, name, description, source_path, sql_text, aliases, created_at, updated_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, array_append($7::text[], translate($1::text, '-', '_')), NOW(), NOW())
    ON CONFLICT (slug) DO UPDATE SET
        name = EXCLUDED.name,
        description = EXCLUDED.description,
        source_path = EXCLUDED.source_path,
        sql_text = EXCLUDED.sql_text,
        aliases = array_append($7::text[], translate(insight.model_catalogue.id::text, '-', '_')),
        updated_at = NOW()
    RETURNING id, slug, name, description, source_path, sql_text, aliases, created_at, updated_at"#;

#[derive(Default)]
struct MemCatalogue {
    records: HashMap<Uuid, ModelCatalogueEntry>,
    by_slug: HashMap<String, Uuid>,
    by_alias: HashMap<String, Uuid>,
}

impl MemCatalogue {
    fn apply(&mut self, draft: &ModelDraft) -> Result<ModelCatalogueEntry, StoreError> {
        let slug = draft.slug.trim().to_string();
        let now = Utc::now();

        let existing = self
            .by_slug
            .get(&slug)
            .and_then(|id| self.records.get(id))
            .cloned();
        // A supplied id that already belongs to another slug would corrupt
        // the indexes; the relational backend rejects it as a primary-key
        // violation, so reject here too.
        if existing.is_none() {
            if let Some(id) = draft.id {
                if self.records.contains_key(&id) {
                    return Err(StoreError::InvalidRecord(format!(
                        "id {id} already belongs to another model"
                    )));
                }
            }
        }
        if let Some(prev) = &existing {
            for alias in &prev.aliases {
                self.by_alias.remove(alias);
            }
        }

        let id = existing
            .as_ref()
            .map(|e| e.id)
            .or(draft.id)
            .unwrap_or_else(Uuid::new_v4);
        let entry = ModelCatalogueEntry {
            id,
            slug: slug.clone(),
            name: draft.display_name(),
            description: draft.description.clone().unwrap_or_default(),
            source_path: draft.source_path.clone().unwrap_or_default(),
            sql: draft.sql.clone().unwrap_or_default(),
            aliases: finalize_aliases(&draft.base_aliases(), id),
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: existing
                .as_ref()
                .map(|e| e.updated_at.max(now))
                .unwrap_or(now),
        };

        for alias in &entry.aliases {
            self.by_alias.insert(alias.clone(), id);
        }
        self.by_slug.insert(slug, id);
        self.records.insert(id, entry.clone());
        Ok(entry)
    }

    fn resolve(&self, key: &str) -> Option<&ModelCatalogueEntry> {
        let trimmed = key.trim();
        if let Ok(id) = Uuid::parse_str(trimmed) {
            if let Some(entry) = self.records.get(&id) {
                return Some(entry);
            }
        }
        if let Some(id) = self.by_slug.get(trimmed) {
            return self.records.get(id);
        }
        self.by_alias
            .get(&normalize_key(trimmed))
            .and_then(|id| self.records.get(id))
    }
}

/// Dual-mode dbt model catalogue: Postgres when connection settings are
/// complete, an in-process map for the lifetime of the process otherwise.
pub struct ModelStore {
    db: DbHandle,
    seeds: Vec<ModelDraft>,
    mem: RwLock<MemCatalogue>,
}

impl ModelStore {
    pub fn new(settings: DbSettings, seeds: Vec<ModelDraft>) -> Self {
        let mut mem = MemCatalogue::default();
        if !settings.configured() {
            // No shared external state to race against, so in-memory mode
            // seeds synchronously at construction.
            for draft in &seeds {
                if let Err(err) = mem.apply(draft) {
                    warn!(slug = %draft.slug, error = %err, "skipping invalid seed model");
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

    /// Pool + schema ensure + one transactional seed pass. Idempotent, no-op
    /// in in-memory mode; a repeat call after a successful first one does
    /// not re-run the seeds.
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
                    &draft.slug.trim(),
                    &draft.display_name(),
                    &draft.description.clone().unwrap_or_default(),
                    &draft.source_path.clone().unwrap_or_default(),
                    &draft.sql.clone().unwrap_or_default(),
                    &draft.base_aliases(),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Every model, name ascending.
    pub async fn fetch_all(&self) -> Result<Vec<ModelCatalogueEntry>, StoreError> {
        if !self.db.configured() {
            let mem = self.read();
            let mut entries: Vec<_> = mem.records.values().cloned().collect();
            entries.sort_by(|a, b| {
                (a.name.to_lowercase(), &a.slug).cmp(&(b.name.to_lowercase(), &b.slug))
            });
            return Ok(entries);
        }

        let client = self.db.client().await?;
        let rows = self
            .db
            .query(
                &client,
                &format!("SELECT {COLUMNS} FROM insight.model_catalogue ORDER BY name ASC, slug ASC"),
                &[],
            )
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Resolve by id, then exact slug, then normalized alias. A string that
    /// is not a UUID simply falls through to the later stages.
    pub async fn get(&self, key: &str) -> Result<Option<ModelCatalogueEntry>, StoreError> {
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
                    &format!("SELECT {COLUMNS} FROM insight.model_catalogue WHERE id = $1"),
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
                &format!("SELECT {COLUMNS} FROM insight.model_catalogue WHERE slug = $1"),
                &[&trimmed],
            )
            .await?;
        if let Some(row) = row {
            return row_to_entry(&row).map(Some);
        }

        // Distinct slugs may share a normalized alias; take the first by
        // display order rather than erroring on the multi-row result.
        let row = self
            .db
            .query_opt(
                &client,
                &format!(
                    "SELECT {COLUMNS} FROM insight.model_catalogue \
                     WHERE $1 = ANY(aliases) ORDER BY name ASC, slug ASC LIMIT 1"
                ),
                &[&normalize_key(trimmed)],
            )
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// Insert or replace by slug, preserving `created_at` and refreshing
    /// `updated_at`. Returns the persisted record.
    pub async fn upsert(&self, draft: ModelDraft) -> Result<ModelCatalogueEntry, StoreError> {
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
                    &draft.slug.trim(),
                    &draft.display_name(),
                    &draft.description.clone().unwrap_or_default(),
                    &draft.source_path.clone().unwrap_or_default(),
                    &draft.sql.clone().unwrap_or_default(),
                    &draft.base_aliases(),
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

fn validate(draft: &ModelDraft) -> Result<(), StoreError> {
    if draft.slug.trim().is_empty() {
        return Err(StoreError::InvalidRecord("model slug must not be empty".into()));
    }
    Ok(())
}

fn row_to_entry(row: &tokio_postgres::Row) -> Result<ModelCatalogueEntry, StoreError> {
    Ok(ModelCatalogueEntry {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        source_path: row.try_get("source_path")?,
        sql: row.try_get("sql_text")?,
        aliases: row.try_get("aliases")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::seed;

    fn seeded() -> ModelStore {
        ModelStore::new(DbSettings::default(), seed::example_models())
    }

    #[tokio::test]
    async fn get_by_id_slug_and_alias_agree() {
        let store = seeded();
        let by_slug = store.get("sales_data").await.unwrap().unwrap();
        let by_id = store
            .get(&by_slug.id.to_string())
            .await
            .unwrap()
            .unwrap();
        let by_alias = store.get("Sales Performance").await.unwrap().unwrap();
        assert_eq!(by_slug.id, by_id.id);
        assert_eq!(by_slug.id, by_alias.id);
    }

    #[tokio::test]
    async fn alias_lookup_is_case_and_punctuation_insensitive() {
        let store = seeded();
        let hit = store.get("sales performance").await.unwrap().unwrap();
        assert_eq!(hit.slug, "sales_data");
        let hit = store.get("sales-performance").await.unwrap().unwrap();
        assert_eq!(hit.slug, "sales_data");
    }

    #[tokio::test]
    async fn unknown_and_malformed_keys_return_none() {
        let store = seeded();
        assert!(store.get("no_such_model").await.unwrap().is_none());
        assert!(store.get("not-a-uuid-@@@").await.unwrap().is_none());
        assert!(store.get("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_record_and_created_at() {
        let store = ModelStore::new(DbSettings::default(), Vec::new());
        let first = store
            .upsert(ModelDraft {
                id: None,
                slug: "revenue".into(),
                name: Some("Revenue v1".into()),
                description: Some("first".into()),
                source_path: None,
                sql: None,
                aliases: None,
            })
            .await
            .unwrap();

        let second = store
            .upsert(ModelDraft {
                id: None,
                slug: "revenue".into(),
                name: Some("Revenue v2".into()),
                description: Some("second".into()),
                source_path: None,
                sql: None,
                aliases: None,
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.name, "Revenue v2");
        assert_eq!(second.description, "second");

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn reseeding_does_not_duplicate_rows() {
        let store = seeded();
        let before = store.fetch_all().await.unwrap().len();
        for draft in seed::example_models() {
            store.upsert(draft).await.unwrap();
        }
        let after = store.fetch_all().await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn fetch_all_is_sorted_by_name() {
        let store = seeded();
        let names: Vec<_> = store
            .fetch_all()
            .await
            .unwrap()
            .iter()
            .map(|e| e.name.to_lowercase())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn shared_alias_still_resolves_to_a_record() {
        let store = ModelStore::new(DbSettings::default(), Vec::new());
        for slug in ["kpi_daily", "kpi_weekly"] {
            store
                .upsert(ModelDraft {
                    id: None,
                    slug: slug.into(),
                    name: None,
                    description: None,
                    source_path: None,
                    sql: None,
                    aliases: Some(vec!["kpi".into()]),
                })
                .await
                .unwrap();
        }
        let hit = store.get("kpi").await.unwrap().unwrap();
        assert!(hit.slug == "kpi_daily" || hit.slug == "kpi_weekly");
    }

    #[tokio::test]
    async fn id_belonging_to_another_slug_is_rejected() {
        let store = ModelStore::new(DbSettings::default(), Vec::new());
        let alpha = store
            .upsert(ModelDraft {
                id: None,
                slug: "alpha".into(),
                name: None,
                description: None,
                source_path: None,
                sql: None,
                aliases: None,
            })
            .await
            .unwrap();

        let err = store
            .upsert(ModelDraft {
                id: Some(alpha.id),
                slug: "beta".into(),
                name: None,
                description: None,
                source_path: None,
                sql: None,
                aliases: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));

        // Indexes stay intact for the original record.
        assert_eq!(store.get("alpha").await.unwrap().unwrap().id, alpha.id);
        assert_eq!(store.fetch_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_init_leaves_records_untouched() {
        let store = seeded();
        store.init().await.unwrap();
        let before = store.fetch_all().await.unwrap();
        store.init().await.unwrap();
        let after = store.fetch_all().await.unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.updated_at, b.updated_at);
        }
    }

    #[tokio::test]
    async fn empty_slug_is_rejected() {
        let store = ModelStore::new(DbSettings::default(), Vec::new());
        let err = store
            .upsert(ModelDraft {
                id: None,
                slug: "   ".into(),
                name: None,
                description: None,
                source_path: None,
                sql: None,
                aliases: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_on_one_slug_leave_one_record() {
        let store = Arc::new(ModelStore::new(DbSettings::default(), Vec::new()));
        let started = Utc::now();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .upsert(ModelDraft {
                        id: None,
                        slug: "contended".into(),
                        name: Some(format!("writer {i}")),
                        description: None,
                        source_path: None,
                        sql: None,
                        aliases: None,
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].updated_at >= started);
    }
}
