//! Fixed example catalogues loaded on first use so the assistant has
//! something to talk about before a real dbt project is registered.

use serde_json::json;

use crate::models::{ModelDraft, SemanticModelDraft};

pub fn example_models() -> Vec<ModelDraft> {
    vec![
        ModelDraft {
            id: None,
            slug: "sales_data".into(),
            name: Some("Sales Data".into()),
            description: Some(
                "Daily sales transactions joined with product and region dimensions.".into(),
            ),
            source_path: Some("models/marts/sales_data.sql".into()),
            sql: Some(
                "select order_date, region, product_category, sum(amount) as revenue\n\
                 from {{ ref('stg_orders') }}\n\
                 group by 1, 2, 3"
                    .into(),
            ),
            aliases: Some(vec!["Sales Performance".into(), "sales".into()]),
        },
        ModelDraft {
            id: None,
            slug: "stg_customers".into(),
            name: Some("Staging: Customers".into()),
            description: Some("Cleaned customer records from the raw CRM export.".into()),
            source_path: Some("models/staging/stg_customers.sql".into()),
            sql: Some(
                "select id as customer_id, lower(email) as email, created_at\n\
                 from {{ source('crm', 'customers') }}"
                    .into(),
            ),
            aliases: Some(vec!["customers".into()]),
        },
        ModelDraft {
            id: None,
            slug: "fct_orders".into(),
            name: Some("Fact: Orders".into()),
            description: Some("One row per order with totals and status.".into()),
            source_path: Some("models/marts/fct_orders.sql".into()),
            sql: Some(
                "select order_id, customer_id, status, order_total, ordered_at\n\
                 from {{ ref('stg_orders') }}"
                    .into(),
            ),
            aliases: Some(vec!["orders".into(), "order facts".into()]),
        },
        ModelDraft {
            id: None,
            slug: "churn_scores".into(),
            name: Some("Churn Scores".into()),
            description: Some("Weekly churn-risk score per active customer.".into()),
            source_path: Some("models/marts/churn_scores.sql".into()),
            sql: Some(
                "select customer_id, score, scored_at\n\
                 from {{ ref('int_churn_features') }}"
                    .into(),
            ),
            aliases: Some(vec!["churn".into(), "churn risk".into()]),
        },
    ]
}

pub fn example_semantic_models() -> Vec<SemanticModelDraft> {
    vec![
        SemanticModelDraft {
            id: None,
            dataset: "sales_data".into(),
            name: Some("Sales".into()),
            description: Some("Revenue measures over time, region, and product.".into()),
            definition: json!({
                "measures": [
                    { "name": "revenue", "agg": "sum", "expr": "amount" },
                    { "name": "order_count", "agg": "count", "expr": "order_id" }
                ],
                "dimensions": [
                    { "name": "order_date", "type": "time", "grain": "day" },
                    { "name": "region", "type": "categorical" },
                    { "name": "product_category", "type": "categorical" }
                ]
            }),
        },
        SemanticModelDraft {
            id: None,
            dataset: "churn_scores".into(),
            name: Some("Customer Churn".into()),
            description: Some("Churn-risk scoring keyed by customer.".into()),
            definition: json!({
                "measures": [
                    { "name": "avg_score", "agg": "avg", "expr": "score" },
                    { "name": "at_risk_customers", "agg": "count_distinct", "expr": "customer_id", "filter": "score > 0.7" }
                ],
                "dimensions": [
                    { "name": "scored_at", "type": "time", "grain": "week" }
                ]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_slugs_are_unique() {
        let models = example_models();
        let mut slugs: Vec<_> = models.iter().map(|m| m.slug.clone()).collect();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), models.len());
    }

    #[test]
    fn sales_data_carries_the_performance_alias() {
        let models = example_models();
        let sales = models.iter().find(|m| m.slug == "sales_data").unwrap();
        assert!(sales
            .aliases
            .as_ref()
            .unwrap()
            .iter()
            .any(|a| a == "Sales Performance"));
    }
}
