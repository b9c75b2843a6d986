//! REST surface
//!
//! The engine's public HTTP interface. No authentication happens
//! here: the upstream authenticator supplies the security context
//! through headers, plus the two administrative toggles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::core::context::SecurityContext;
use crate::core::error::EngineError;
use crate::core::record::{now_rfc3339, Id, Record};
use crate::engine::Engine;
use crate::relations::{RelatedMode, Relations};
use crate::schema::{DataType, CLASS};
use crate::storage::QueryOptions;

use super::errors::{ApiError, ApiResult};
use super::params::parse_query;

/// Context headers supplied by the upstream authenticator
const USER_HEADER: &str = "x-user-id";
const APP_HEADER: &str = "x-app-id";
const DOMAIN_HEADER: &str = "x-domain";
/// Engine-recognized administrative toggles
const DISABLE_OWNERSHIP_HEADER: &str = "x-disable-ownership";
const ALLOW_CUSTOM_IDS_HEADER: &str = "x-allow-custom-ids";

pub struct RestState {
    engine: Arc<Engine>,
    exports_dir: PathBuf,
}

type AppState = Arc<RestState>;

/// Build the router over an engine.
pub fn router(engine: Arc<Engine>, exports_dir: PathBuf) -> Router {
    let state = Arc::new(RestState {
        engine,
        exports_dir,
    });

    Router::new()
        .route("/health", get(health))
        .route("/class", get(list_classes).post(post_class))
        .route("/class/:id", get(get_class).delete(delete_class))
        .route("/class/:id/props", get(class_props))
        .route("/store/:class", get(list_store).post(create_record))
        .route(
            "/store/:class/:id",
            get(get_record).put(put_record).delete(delete_record),
        )
        .route("/store/:class/:id/:prop", get(get_prop).put(put_prop))
        .route("/query/:class", get(query_class))
        .route("/find/:id", get(find_record))
        .route("/genesis", get(genesis_status).post(run_genesis))
        .route("/export", post(run_export))
        .route("/exports", get(list_exports))
        .route("/reset", post(run_reset))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn context_from(headers: &HeaderMap) -> SecurityContext {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    let flag = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };

    SecurityContext {
        user_id: text(USER_HEADER),
        app_id: text(APP_HEADER),
        domain: text(DOMAIN_HEADER),
        disable_ownership: flag(DISABLE_OWNERSHIP_HEADER),
        allow_custom_ids: flag(ALLOW_CUSTOM_IDS_HEADER),
    }
}

/// Path ids parse as integers when they look like one.
fn parse_id(raw: &str) -> Id {
    match raw.parse::<i64>() {
        Ok(n) => Id::Int(n),
        Err(_) => Id::Str(raw.to_string()),
    }
}

fn record_from_body(body: Value) -> ApiResult<Record> {
    Record::from_value(body)
        .map_err(|e| ApiError(EngineError::InvalidParams(format!("malformed record: {}", e))))
}

/// Strip server-only props before a record leaves the API.
async fn present(state: &RestState, class_id: &str, record: &Record) -> Value {
    let mut value = record.to_value();
    if let Ok(Some(meta)) = state.engine.registry().get_class(class_id).await {
        if let Some(obj) = value.as_object_mut() {
            for prop in &meta.effective_props {
                if prop.server_only {
                    obj.remove(&prop.key);
                }
            }
        }
    }
    value
}

async fn present_all(state: &RestState, class_id: &str, records: &[Record]) -> Vec<Value> {
    let mut values = Vec::with_capacity(records.len());
    for record in records {
        values.push(present(state, class_id, record).await);
    }
    values
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_classes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let records = state.engine.list_objects(CLASS, &ctx).await?;
    Ok(Json(Value::Array(
        records.iter().map(Record::to_value).collect(),
    )))
}

async fn get_class(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let record = state
        .engine
        .get_object(CLASS, &Id::Str(id.clone()), &ctx)
        .await?
        .ok_or_else(|| EngineError::not_found(CLASS, &id))?;
    Ok(Json(record.to_value()))
}

async fn class_props(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let props = state
        .engine
        .registry()
        .get_class_props(&id)
        .await?
        .ok_or_else(|| EngineError::not_found(CLASS, &id))?;
    Ok(Json(serde_json::to_value(props).unwrap_or_default()))
}

async fn post_class(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let input = record_from_body(body)?;
    let stored = state.engine.set_object(CLASS, input, &ctx).await?;
    Ok(Json(stored.to_value()))
}

async fn delete_class(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    state
        .engine
        .delete_object(CLASS, &Id::Str(id.clone()), &ctx)
        .await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn list_store(
    State(state): State<AppState>,
    Path(class): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let records = state.engine.list_objects(&class, &ctx).await?;
    Ok(Json(Value::Array(present_all(&state, &class, &records).await)))
}

async fn create_record(
    State(state): State<AppState>,
    Path(class): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let ctx = context_from(&headers);
    let input = record_from_body(body)?;
    let stored = state.engine.set_object(&class, input, &ctx).await?;
    let value = present(&state, &class, &stored).await;
    Ok((StatusCode::CREATED, Json(value)))
}

async fn get_record(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let record = state
        .engine
        .get_object(&class, &parse_id(&id), &ctx)
        .await?
        .ok_or_else(|| EngineError::not_found(&class, &id))?;
    Ok(Json(present(&state, &class, &record).await))
}

async fn put_record(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let input = record_from_body(body)?;
    let stored = state
        .engine
        .set_object_at(&class, input, Some(parse_id(&id)), &ctx)
        .await?;
    Ok(Json(present(&state, &class, &stored).await))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((class, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let record_id = parse_id(&id);

    // fetch first so nullify-policy references can be cleared after
    let prior = state.engine.get_object(&class, &record_id, &ctx).await?;
    state.engine.delete_object(&class, &record_id, &ctx).await?;
    if let Some(prior) = prior {
        Relations::new(&state.engine)
            .detach_references(&prior, &ctx)
            .await?;
    }

    Ok(Json(json!({ "deleted": id })))
}

async fn get_prop(
    State(state): State<AppState>,
    Path((class, id, prop)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let record = state
        .engine
        .get_object(&class, &parse_id(&id), &ctx)
        .await?
        .ok_or_else(|| EngineError::not_found(&class, &id))?;

    let meta = state
        .engine
        .registry()
        .get_class(&class)
        .await?
        .ok_or_else(|| EngineError::not_found(CLASS, &class))?;

    // relations resolve to records, everything else returns the value
    match meta.prop(&prop) {
        Some(def) if def.data_type == DataType::Relation => {
            let related = Relations::new(&state.engine)
                .get_related(
                    &record,
                    &prop,
                    RelatedMode::Resolve,
                    &[],
                    &QueryOptions::default(),
                    &ctx,
                )
                .await?;
            let values = present_all(&state, &class, &related).await;
            if def.is_array {
                Ok(Json(Value::Array(values)))
            } else {
                Ok(Json(values.into_iter().next().unwrap_or(Value::Null)))
            }
        }
        _ => Ok(Json(record.get(&prop).cloned().unwrap_or(Value::Null))),
    }
}

async fn put_prop(
    State(state): State<AppState>,
    Path((class, id, prop)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let input = Record::new(class.clone())
        .with_id(parse_id(&id))
        .with_field(prop, body);
    let stored = state.engine.set_object(&class, input, &ctx).await?;
    Ok(Json(present(&state, &class, &stored).await))
}

async fn query_class(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let (filters, options) = parse_query(&params)?;
    let records = state
        .engine
        .query_objects(&class, &filters, &options, &ctx)
        .await?;
    Ok(Json(Value::Array(present_all(&state, &class, &records).await)))
}

async fn find_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    let record = state
        .engine
        .find_object(&parse_id(&id), &ctx)
        .await?
        .ok_or_else(|| EngineError::not_found("*", &id))?;
    let class = record.class_id.clone();
    Ok(Json(present(&state, &class, &record).await))
}

async fn run_genesis(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.registry().reseed().await?;
    Ok(Json(json!({ "status": "seeded" })))
}

async fn genesis_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.registry().ensure_bootstrap().await?;
    let missing = state.engine.registry().verify_bootstrap().await?;
    Ok(Json(json!({
        "status": if missing.is_empty() { "ok" } else { "incomplete" },
        "missing": missing,
    })))
}

async fn run_export(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);

    let mut dump = serde_json::Map::new();
    let mut record_count = 0usize;
    for def in state.engine.registry().all_classes().await? {
        let records = state.engine.list_objects(&def.id, &ctx).await?;
        record_count += records.len();
        dump.insert(
            def.id.clone(),
            Value::Array(records.iter().map(Record::to_value).collect()),
        );
    }

    let file_name = format!("export-{}.json", now_rfc3339().replace(':', "-"));
    let path = state.exports_dir.join(&file_name);
    std::fs::create_dir_all(&state.exports_dir)
        .and_then(|_| {
            std::fs::write(
                &path,
                serde_json::to_string_pretty(&dump).unwrap_or_default(),
            )
        })
        .map_err(|e| {
            EngineError::InvalidParams(format!("export write failed: {}", e))
        })?;

    Ok(Json(json!({
        "file": file_name,
        "classes": dump.len(),
        "records": record_count,
    })))
}

async fn list_exports(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.exports_dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    files.push(Value::from(name.to_string()));
                }
            }
        }
    }
    files.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    Ok(Json(Value::Array(files)))
}

async fn run_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = context_from(&headers);
    state.engine.reset(&ctx).await?;
    Ok(Json(json!({ "status": "reset" })))
}
