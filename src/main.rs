mod api;
mod config;
mod db;
mod error;
mod model_store;
mod models;
mod normalize;
mod pref_store;
mod seed;
mod semantic_store;
mod viz_store;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use config::Config;
use model_store::ModelStore;
use pref_store::PreferenceStore;
use semantic_store::SemanticStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use viz_store::VizStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub models: Arc<ModelStore>,
    pub semantics: Arc<SemanticStore>,
    pub visualizations: Arc<VizStore>,
    pub preferences: Arc<PreferenceStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_catalog_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        storage = if config.db.configured() { "postgres" } else { "memory" },
        "catalogue storage mode selected"
    );

    let models = Arc::new(ModelStore::new(config.db.clone(), seed::example_models()));
    let semantics = Arc::new(SemanticStore::new(
        config.db.clone(),
        seed::example_semantic_models(),
    ));
    let visualizations = Arc::new(VizStore::new(config.db.clone()));
    let preferences = Arc::new(PreferenceStore::new(config.db.clone()));

    // Connectivity problems here are fatal; a half-working backend is worse
    // than refusing to start.
    models.init().await.context("initializing model catalogue")?;
    semantics
        .init()
        .await
        .context("initializing semantic model catalogue")?;
    visualizations
        .init()
        .await
        .context("initializing visualization catalogue")?;
    preferences
        .init()
        .await
        .context("initializing preference store")?;

    let state = AppState {
        config: config.clone(),
        models,
        semantics,
        visualizations,
        preferences,
    };

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/models", get(api::list_models).post(api::upsert_model))
        .route("/v1/models/{key}", get(api::get_model))
        .route(
            "/v1/semantic-models",
            get(api::list_semantic_models).post(api::upsert_semantic_model),
        )
        .route("/v1/semantic-models/{key}", get(api::get_semantic_model))
        .route(
            "/v1/visualizations",
            get(api::list_visualizations).post(api::upsert_visualization),
        )
        .route(
            "/v1/visualizations/{id}",
            get(api::get_visualization).delete(api::delete_visualization),
        )
        .route(
            "/v1/preferences/{user_id}",
            get(api::get_preferences).put(api::put_preferences),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("insight-catalog-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
