use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    config::DbSettings,
    db::{DbHandle, TableDdl},
    error::StoreError,
    models::{VisualizationDraft, VisualizationEntry},
};

static DDL: TableDdl = TableDdl {
    table: "insight.visualizations",
    create: &[r#"
        CREATE TABLE IF NOT EXISTS insight.visualizations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            chart_type TEXT NOT NULL,
            chart_config JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#],
    patches: &[
        "ALTER TABLE insight.visualizations ADD COLUMN IF NOT EXISTS chart_code TEXT",
        "ALTER TABLE insight.visualizations ADD COLUMN IF NOT EXISTS insights TEXT[] NOT NULL DEFAULT '{}'",
        "ALTER TABLE insight.visualizations ADD COLUMN IF NOT EXISTS dataset TEXT",
        "ALTER TABLE insight.visualizations ADD COLUMN IF NOT EXISTS semantic_model TEXT",
        "ALTER TABLE insight.visualizations ADD COLUMN IF NOT EXISTS metadata JSONB",
    ],
};

const COLUMNS: &str = "id, title, description, chart_type, chart_config, chart_code, insights, \
                       dataset, semantic_model, metadata, created_at, updated_at";

const UPSERT: &str = r#"
    INSERT INTO insight.visualizations
        (id, title, description, chart_type, chart_config, chart_code, insights,
         dataset, semantic_model, metadata, created_at, updated_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
    ON CONFLICT (id) DO UPDATE SET
        title = EXCLUDED.title,
        description = EXCLUDED.description,
        chart_type = EXCLUDED.chart_type,
        chart_config = EXCLUDED.chart_config,
        chart_code = EXCLUDED.chart_code,
        insights = EXCLUDED.insights,
        dataset = EXCLUDED.dataset,
        semantic_model = EXCLUDED.semantic_model,
        metadata = EXCLUDED.metadata,
        updated_at = NOW()
    RETURNING id, title, description, chart_type, chart_config, chart_code, insights,
              dataset, semantic_model, metadata, created_at, updated_at"#;

#[derive(Default)]
struct MemCatalogue {
    records: HashMap<String, VisualizationEntry>,
}

impl MemCatalogue {
    fn apply(&mut self, draft: &VisualizationDraft) -> VisualizationEntry {
        let id = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let existing = self.records.get(&id);

        let entry = VisualizationEntry {
            id: id.clone(),
            title: draft.title.trim().to_string(),
            description: draft.description.clone().unwrap_or_default(),
            chart_type: draft.chart_type.clone(),
            chart_config: draft.chart_config.clone(),
            chart_code: draft.chart_code.clone(),
            insights: draft.insights.clone().unwrap_or_default(),
            dataset: draft.dataset.clone(),
            semantic_model: draft.semantic_model.clone(),
            metadata: draft.metadata.clone(),
            created_at: existing.map(|e| e.created_at).unwrap_or(now),
            updated_at: existing.map(|e| e.updated_at.max(now)).unwrap_or(now),
        };
        self.records.insert(id, entry.clone());
        entry
    }
}

/// Dual-mode visualization catalogue. The only family with delete, since the
/// assistant lets users discard generated charts.
pub struct VizStore {
    db: DbHandle,
    mem: RwLock<MemCatalogue>,
}

impl VizStore {
    pub fn new(settings: DbSettings) -> Self {
        Self {
            db: DbHandle::new(settings, &DDL),
            mem: RwLock::new(MemCatalogue::default()),
        }
    }

    pub fn configured(&self) -> bool {
        self.db.configured()
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.db.init().await.map(|_| ())
    }

    /// Every visualization, newest first.
    pub async fn fetch_all(&self) -> Result<Vec<VisualizationEntry>, StoreError> {
        if !self.db.configured() {
            let mem = self.read();
            let mut entries: Vec<_> = mem.records.values().cloned().collect();
            entries.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            return Ok(entries);
        }

        let client = self.db.client().await?;
        let rows = self
            .db
            .query(
                &client,
                &format!(
                    "SELECT {COLUMNS} FROM insight.visualizations \
                     ORDER BY created_at DESC, id DESC"
                ),
                &[],
            )
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<VisualizationEntry>, StoreError> {
        if !self.db.configured() {
            return Ok(self.read().records.get(id.trim()).cloned());
        }

        let client = self.db.client().await?;
        let row = self
            .db
            .query_opt(
                &client,
                &format!("SELECT {COLUMNS} FROM insight.visualizations WHERE id = $1"),
                &[&id.trim()],
            )
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    pub async fn upsert(&self, draft: VisualizationDraft) -> Result<VisualizationEntry, StoreError> {
        validate(&draft)?;

        if !self.db.configured() {
            return Ok(self.write().apply(&draft));
        }

        let client = self.db.client().await?;
        let id = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let row = self
            .db
            .query_one(
                &client,
                UPSERT,
                &[
                    &id,
                    &draft.title.trim(),
                    &draft.description.clone().unwrap_or_default(),
                    &draft.chart_type,
                    &draft.chart_config,
                    &draft.chart_code,
                    &draft.insights.clone().unwrap_or_default(),
                    &draft.dataset,
                    &draft.semantic_model,
                    &draft.metadata,
                ],
            )
            .await?;
        row_to_entry(&row)
    }

    /// Returns whether a record was actually removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        if !self.db.configured() {
            return Ok(self.write().records.remove(id.trim()).is_some());
        }

        let client = self.db.client().await?;
        let count = self
            .db
            .execute(
                &client,
                "DELETE FROM insight.visualizations WHERE id = $1",
                &[&id.trim()],
            )
            .await?;
        Ok(count > 0)
    }

    fn read(&self) -> RwLockReadGuard<'_, MemCatalogue> {
        self.mem.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemCatalogue> {
        self.mem.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate(draft: &VisualizationDraft) -> Result<(), StoreError> {
    if draft.title.trim().is_empty() {
        return Err(StoreError::InvalidRecord(
            "visualization title must not be empty".into(),
        ));
    }
    if draft.chart_type.trim().is_empty() {
        return Err(StoreError::InvalidRecord(
            "visualization chart type must not be empty".into(),
        ));
    }
    Ok(())
}

fn row_to_entry(row: &tokio_postgres::Row) -> Result<VisualizationEntry, StoreError> {
    Ok(VisualizationEntry {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        chart_type: row.try_get("chart_type")?,
        chart_config: row.try_get("chart_config")?,
        chart_code: row.try_get("chart_code")?,
        insights: row.try_get("insights")?,
        dataset: row.try_get("dataset")?,
        semantic_model: row.try_get("semantic_model")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn draft(title: &str) -> VisualizationDraft {
        VisualizationDraft {
            id: None,
            title: title.into(),
            description: None,
            chart_type: "bar".into(),
            chart_config: json!({ "series": [] }),
            chart_code: None,
            insights: Some(vec!["revenue is up".into()]),
            dataset: Some("sales_data".into()),
            semantic_model: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let store = VizStore::new(DbSettings::default());
        let entry = store.upsert(draft("Revenue by month")).await.unwrap();
        assert!(!entry.id.is_empty());
        assert!(Uuid::parse_str(&entry.id).is_ok());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = VizStore::new(DbSettings::default());
        let entry = store.upsert(draft("Churn trend")).await.unwrap();

        assert!(!store.delete("missing-id").await.unwrap());
        assert_eq!(store.fetch_all().await.unwrap().len(), 1);

        assert!(store.delete(&entry.id).await.unwrap());
        assert!(store.fetch_all().await.unwrap().is_empty());
        assert!(store.get(&entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_by_id_replaces_and_keeps_created_at() {
        let store = VizStore::new(DbSettings::default());
        let first = store.upsert(draft("Original title")).await.unwrap();

        let mut second_draft = draft("Updated title");
        second_draft.id = Some(first.id.clone());
        let second = store.upsert(second_draft).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.title, "Updated title");
        assert_eq!(store.fetch_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_all_is_newest_first() {
        let store = VizStore::new(DbSettings::default());
        for i in 0..3 {
            store.upsert(draft(&format!("chart {i}"))).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn blank_title_is_rejected() {
        let store = VizStore::new(DbSettings::default());
        let err = store.upsert(draft("  ")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
