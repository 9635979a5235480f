//! Axum JSON API over the query engine, one shared engine for every client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bidlet_core::CountyTable;
use bidlet_query::{
    AllowList, AllowListOrigin, DateRange, DescriptionFilter, FilterSpec, PriceSummary, QuantityRange,
    QueryEngine,
};
use bidlet_storage::load_dataset;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "bidlet-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub dataset_path: PathBuf,
    pub allow_list_path: PathBuf,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            dataset_path: std::env::var("BIDLET_DATASET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/bid_records.parquet")),
            allow_list_path: std::env::var("BIDLET_ALLOW_LIST")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rcoc_projects.txt")),
            port: std::env::var("BIDLET_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: QueryEngine,
}

impl AppState {
    pub fn new(engine: QueryEngine) -> Self {
        Self { engine }
    }

    pub fn load(config: &WebConfig) -> anyhow::Result<Self> {
        let dataset = load_dataset(&config.dataset_path)
            .with_context(|| format!("loading dataset {}", config.dataset_path.display()))?;
        let allow_list = AllowList::load_or_empty(&config.allow_list_path);
        Ok(Self::new(QueryEngine::new(dataset, CountyTable::michigan(), allow_list)))
    }
}

#[derive(Debug, Serialize)]
struct Health<'a> {
    status: &'static str,
    records: usize,
    allow_list_entries: usize,
    allow_list: &'a AllowListOrigin,
}

#[derive(Debug, Serialize)]
struct CountyRow<'a> {
    code: String,
    name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct BoundsQuery {
    description: Option<String>,
    contains: Option<String>,
}

#[derive(Debug, Serialize)]
struct Bounds {
    quantity: Option<QuantityRange>,
    letting_dates: Option<DateRange>,
}

#[derive(Debug, Serialize)]
struct QueryResponse<'a> {
    empty: bool,
    count: usize,
    summary: Option<PriceSummary>,
    records: Vec<&'a bidlet_core::BidRecord>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/counties", get(counties_handler))
        .route("/api/descriptions", get(descriptions_handler))
        .route("/api/bounds", get(bounds_handler))
        .route("/api/query", post(query_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::load(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, records = state.engine.dataset().len(), "serving query API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let allow_list = state.engine.allow_list();
    Json(Health {
        status: "ok",
        records: state.engine.dataset().len(),
        allow_list_entries: allow_list.len(),
        allow_list: allow_list.origin(),
    })
    .into_response()
}

async fn counties_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows = state
        .engine
        .counties()
        .iter()
        .map(|(code, name)| CountyRow {
            code: format!("{code:02}"),
            name,
        })
        .collect::<Vec<_>>();
    Json(rows).into_response()
}

async fn descriptions_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.descriptions()).into_response()
}

async fn bounds_handler(State(state): State<Arc<AppState>>, Query(q): Query<BoundsQuery>) -> Response {
    let filter = DescriptionFilter {
        exact: q.description,
        contains: q.contains,
    };
    Json(Bounds {
        quantity: state.engine.quantity_bounds(&filter),
        letting_dates: state.engine.date_span(),
    })
    .into_response()
}

async fn query_handler(State(state): State<Arc<AppState>>, Json(spec): Json<FilterSpec>) -> Response {
    let result = state.engine.execute(&spec);
    Json(QueryResponse {
        empty: result.is_empty(),
        count: result.len(),
        summary: result.summary,
        records: result.records,
    })
    .into_response()
}
