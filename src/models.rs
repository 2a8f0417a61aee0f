use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::normalize::normalize_key;

/// One dbt-style model in the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalogueEntry {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub source_path: String,
    pub sql: String,
    /// Derived lookup index: normalized slug, normalized id, and every
    /// supplied alias in normalized form. Never authoritative on its own.
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for the model catalogue. A missing id is generated; the
/// slug is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDraft {
    pub id: Option<Uuid>,
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_path: Option<String>,
    pub sql: Option<String>,
    pub aliases: Option<Vec<String>>,
}

impl ModelDraft {
    /// Aliases supplied by the caller plus the normalized slug, all in
    /// normalized form. The id-derived alias is appended by the store once
    /// the surviving row's id is known.
    pub fn base_aliases(&self) -> Vec<String> {
        let mut set = BTreeSet::new();
        set.insert(normalize_key(&self.slug));
        for alias in self.aliases.iter().flatten() {
            let key = normalize_key(alias);
            if !key.is_empty() {
                set.insert(key);
            }
        }
        set.into_iter().collect()
    }

    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.slug.trim().to_string())
    }
}

/// Append the id-derived alias to a base alias list, keeping it deduplicated.
pub fn finalize_aliases(base: &[String], id: Uuid) -> Vec<String> {
    let mut set: BTreeSet<String> = base.iter().cloned().collect();
    set.insert(normalize_key(&id.to_string()));
    set.into_iter().collect()
}

/// One semantic model: a dataset plus its JSON definition (measures,
/// dimensions, joins).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticModelEntry {
    pub id: Uuid,
    pub dataset: String,
    pub name: String,
    pub description: String,
    pub definition: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticModelDraft {
    pub id: Option<Uuid>,
    pub dataset: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Value,
}

impl SemanticModelDraft {
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.dataset.trim().to_string())
    }
}

/// A generated visualization: chart config plus the context it was built
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    pub chart_type: String,
    pub chart_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_code: Option<String>,
    pub insights: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationDraft {
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub chart_type: String,
    #[serde(default)]
    pub chart_config: Value,
    pub chart_code: Option<String>,
    pub insights: Option<Vec<String>>,
    pub dataset: Option<String>,
    pub semantic_model: Option<String>,
    pub metadata: Option<Value>,
}

/// Per-user assistant preferences, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceEntry {
    pub user_id: String,
    pub preferences: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_aliases_are_normalized_and_deduplicated() {
        let draft = ModelDraft {
            id: None,
            slug: "sales_data".into(),
            name: None,
            description: None,
            source_path: None,
            sql: None,
            aliases: Some(vec![
                "Sales Performance".into(),
                "sales-performance".into(),
                "  ".into(),
            ]),
        };
        let aliases = draft.base_aliases();
        assert_eq!(aliases, vec!["sales_data", "sales_performance"]);
    }

    #[test]
    fn finalize_appends_id_alias() {
        let id = Uuid::new_v4();
        let aliases = finalize_aliases(&["churn".to_string()], id);
        assert!(aliases.contains(&normalize_key(&id.to_string())));
        assert!(aliases.contains(&"churn".to_string()));
    }

    #[test]
    fn display_name_falls_back_to_natural_key() {
        let draft = SemanticModelDraft {
            id: None,
            dataset: "churn".into(),
            name: Some("  ".into()),
            description: None,
            definition: serde_json::json!({}),
        };
        assert_eq!(draft.display_name(), "churn");
    }
}
