//! Cache-aware HTTP origin used to exercise the engine end to end.
//!
//! Items answer with an `ETag` and `Cache-Control: max-age`, and honour
//! `If-None-Match` with `304 Not Modified`. Every request except
//! `/__stats` is counted so tests can tell physical transfers from cache
//! hits.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const USERNAME: &str = "ann";
pub const PASSWORD: &str = "secret";
pub const REALM: &str = "netkit";

const DEFAULT_MAX_AGE: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub version: u64,
}

impl Item {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: format!("item {id}"),
            version: 1,
        }
    }

    pub fn etag(&self) -> String {
        format!("\"{}-v{}\"", self.id, self.version)
    }
}

#[derive(Deserialize)]
pub struct CreateItem {
    pub title: String,
}

#[derive(Deserialize)]
pub struct UpdateItem {
    pub title: String,
}

/// Request counts per path, plus the order side-effecting requests arrived.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
    pub hits: BTreeMap<String, u64>,
    pub writes: Vec<String>,
}

#[derive(Clone, Default)]
pub struct AppState {
    items: Arc<RwLock<HashMap<String, Item>>>,
    stats: Arc<RwLock<Stats>>,
}

#[derive(Deserialize)]
struct CacheParams {
    max_age: Option<u64>,
}

#[derive(Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

pub fn app() -> Router {
    let state = AppState::default();
    Router::new()
        .route("/items", post(create_item))
        .route("/items/{id}", get(get_item).put(update_item))
        .route("/nocache", get(no_cache))
        .route("/protected", get(protected))
        .route("/slow", get(slow))
        .route("/__stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), count_request))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn count_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path != "/__stats" {
        let method = request.method().clone();
        tracing::debug!(%method, %path, "request");
        let mut stats = state.stats.write().await;
        *stats.hits.entry(path.clone()).or_default() += 1;
        if method != axum::http::Method::GET && method != axum::http::Method::HEAD {
            stats.writes.push(format!("{method} {path}"));
        }
    }
    next.run(request).await
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CacheParams>,
    headers: HeaderMap,
) -> Response {
    let item = {
        let mut items = state.items.write().await;
        items.entry(id.clone()).or_insert_with(|| Item::new(&id)).clone()
    };
    let etag = item.etag();
    let cache_control = format!("max-age={}", params.max_age.unwrap_or(DEFAULT_MAX_AGE));

    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    if matches {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::CACHE_CONTROL, cache_control)],
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::ETAG, etag), (header::CACHE_CONTROL, cache_control)],
        Json(item),
    )
        .into_response()
}

async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateItem>,
) -> Json<Item> {
    let mut items = state.items.write().await;
    let item = items.entry(id.clone()).or_insert_with(|| Item::new(&id));
    item.title = input.title;
    item.version += 1;
    Json(item.clone())
}

async fn create_item(
    State(state): State<AppState>,
    Json(input): Json<CreateItem>,
) -> (StatusCode, Json<Item>) {
    let item = Item {
        id: Uuid::new_v4().to_string(),
        title: input.title,
        version: 1,
    };
    state.items.write().await.insert(item.id.clone(), item.clone());
    (StatusCode::CREATED, Json(item))
}

async fn no_cache() -> impl IntoResponse {
    ([(header::CACHE_CONTROL, "no-store")], "volatile")
}

async fn protected(headers: HeaderMap) -> Response {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{USERNAME}:{PASSWORD}"))
    );
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if authorized {
        return (StatusCode::OK, "welcome").into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{REALM}\""))],
        "credentials required",
    )
        .into_response()
}

async fn slow(Query(params): Query<SlowParams>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms.unwrap_or(500))).await;
    "finally"
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.stats.read().await.clone())
}
