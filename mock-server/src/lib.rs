use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// A single coded reference entry, grouped into named datasets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateEntry {
    pub code: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateEntry {
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    datasets: Arc<RwLock<HashMap<String, Vec<Entry>>>>,
    /// GET hits per dataset, for "exactly one call" assertions in client
    /// dedup tests. `/slow/{dataset}` counts toward the same dataset.
    hits: Arc<RwLock<HashMap<String, u64>>>,
}

fn seed_entry(code: &str, name: &str) -> Entry {
    Entry { id: Uuid::new_v4(), code: code.to_string(), name: name.to_string() }
}

pub fn app() -> Router {
    let mut datasets = HashMap::new();
    datasets.insert(
        "alpha".to_string(),
        vec![
            seed_entry("col", "Colombia"),
            seed_entry("pe", "Peru"),
            seed_entry("at", "Austria"),
            seed_entry("de", "Germany"),
        ],
    );
    let state = AppState {
        datasets: Arc::new(RwLock::new(datasets)),
        hits: Arc::new(RwLock::new(HashMap::new())),
    };
    Router::new()
        .route("/__hits/{dataset}", get(read_hits))
        .route("/slow/{dataset}", get(list_slow))
        .route("/{dataset}", get(list_entries).post(create_entry))
        .route("/{dataset}/{id}", get(get_entry).put(update_entry).delete(delete_entry))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn record_hit(state: &AppState, dataset: &str) {
    *state.hits.write().await.entry(dataset.to_string()).or_insert(0) += 1;
}

/// List a dataset, optionally filtered to `codes=a,b,c`. `X-Total-Count`
/// carries the unfiltered dataset size; `Content-Language` is fixed.
async fn list_body(
    state: &AppState,
    dataset: &str,
    query: &HashMap<String, String>,
) -> (HeaderMap, Json<Vec<Entry>>) {
    let datasets = state.datasets.read().await;
    let all = datasets.get(dataset).cloned().unwrap_or_default();
    let total = all.len();
    let filtered = match query.get("codes") {
        Some(codes) => {
            let wanted: Vec<&str> = codes.split(',').collect();
            all.into_iter().filter(|e| wanted.contains(&e.code.as_str())).collect()
        }
        None => all,
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-total-count",
        HeaderValue::from_str(&total.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    headers.insert(header::CONTENT_LANGUAGE, HeaderValue::from_static("en"));
    (headers, Json(filtered))
}

async fn list_entries(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> (HeaderMap, Json<Vec<Entry>>) {
    record_hit(&state, &dataset).await;
    list_body(&state, &dataset, &query).await
}

/// Same as `list_entries` but delayed (`delay_ms`, default 300), so
/// client tests have a window to attach or cancel subscribers.
async fn list_slow(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> (HeaderMap, Json<Vec<Entry>>) {
    record_hit(&state, &dataset).await;
    let delay = query.get("delay_ms").and_then(|v| v.parse().ok()).unwrap_or(300);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    list_body(&state, &dataset, &query).await
}

async fn read_hits(State(state): State<AppState>, Path(dataset): Path<String>) -> Json<u64> {
    Json(state.hits.read().await.get(&dataset).copied().unwrap_or(0))
}

async fn create_entry(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Json(input): Json<CreateEntry>,
) -> (StatusCode, Json<Entry>) {
    let entry = Entry { id: Uuid::new_v4(), code: input.code, name: input.name };
    state.datasets.write().await.entry(dataset).or_default().push(entry.clone());
    (StatusCode::CREATED, Json(entry))
}

async fn get_entry(
    State(state): State<AppState>,
    Path((dataset, id)): Path<(String, Uuid)>,
) -> Result<Json<Entry>, StatusCode> {
    let datasets = state.datasets.read().await;
    datasets
        .get(&dataset)
        .and_then(|entries| entries.iter().find(|e| e.id == id))
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn update_entry(
    State(state): State<AppState>,
    Path((dataset, id)): Path<(String, Uuid)>,
    Json(input): Json<UpdateEntry>,
) -> Result<Json<Entry>, StatusCode> {
    let mut datasets = state.datasets.write().await;
    let entry = datasets
        .get_mut(&dataset)
        .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
        .ok_or(StatusCode::NOT_FOUND)?;
    if let Some(code) = input.code {
        entry.code = code;
    }
    if let Some(name) = input.name {
        entry.name = name;
    }
    Ok(Json(entry.clone()))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path((dataset, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, StatusCode> {
    let mut datasets = state.datasets.write().await;
    let entries = datasets.get_mut(&dataset).ok_or(StatusCode::NOT_FOUND)?;
    let before = entries.len();
    entries.retain(|e| e.id != id);
    if entries.len() == before {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::NO_CONTENT)
}
