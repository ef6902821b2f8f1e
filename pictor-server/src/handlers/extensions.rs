//! Extension management endpoints.
//!
//! The management surface sits behind the deployment's authentication
//! guard; inside the host, callers are either the admin API or an
//! extension identifying itself with its per-run credentials.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::{Value, json};

use pictor_core::host::Caller;
use pictor_model::manifest::Capability;
use pictor_model::{ExtendedManifest, ExtensionId, ImageId};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

fn parse_id(raw: &str) -> AppResult<ExtensionId> {
    ExtensionId::parse(raw)
        .map_err(|err| AppError::bad_request(err.to_string()))
}

/// Resolve the caller identity from extension credential headers; absent
/// or invalid credentials fall back to the (externally guarded) admin
/// surface.
async fn caller_from(state: &AppState, headers: &HeaderMap) -> Caller {
    let id = headers
        .get("x-extension-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| ExtensionId::parse(raw).ok());
    let key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(pictor_model::ApiKey::new);
    if let (Some(id), Some(key)) = (id, key) {
        if state.host.auth().verify(&id, &key).await {
            return Caller::Extension(id);
        }
    }
    Caller::Admin
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_paused: bool,
}

pub async fn list_extensions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ExtendedManifest>>> {
    Ok(Json(state.host.list(query.include_paused).await?))
}

pub async fn get_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ExtendedManifest>> {
    let id = parse_id(&id)?;
    state
        .host
        .registry()
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("extension {id}")))
}

pub async fn install_extension(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<ExtendedManifest>> {
    let extended = state.host.install(None, body.to_vec()).await?;
    Ok(Json(extended))
}

pub async fn update_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<Json<ExtendedManifest>> {
    let id = parse_id(&id)?;
    let extended = state.host.install(Some(&id), body.to_vec()).await?;
    Ok(Json(extended))
}

pub async fn uninstall_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.host.uninstall(&id).await?;
    Ok(Json(json!({ "uninstalled": id })))
}

pub async fn pause_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.host.pause(&id).await?;
    Ok(Json(json!({ "paused": id })))
}

pub async fn resume_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.host.resume(&id).await?;
    Ok(Json(json!({ "resumed": id })))
}

pub async fn synchronise_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.host.synchronise(&id).await?;
    Ok(Json(json!({ "synchronising": id })))
}

pub async fn get_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let value = state.host.get_settings(&id).await?;
    Ok(Json(value.unwrap_or(Value::Null)))
}

pub async fn put_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(value): Json<Value>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.host.update_settings(&id, value).await?;
    Ok(Json(json!({ "updated": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCommandRequest {
    pub command_id: String,
    #[serde(default)]
    pub image_ids: Vec<ImageId>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

pub async fn run_image_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ImageCommandRequest>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let caller = caller_from(&state, &headers).await;
    state
        .host
        .run_image_command(
            &caller,
            &id,
            &request.command_id,
            request.image_ids,
            request.parameters,
        )
        .await?;
    Ok(Json(json!({ "dispatched": request.command_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCommandRequest {
    pub command_id: String,
    #[serde(default)]
    pub parameters: Option<Value>,
}

pub async fn run_process_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ProcessCommandRequest>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let caller = caller_from(&state, &headers).await;
    state
        .host
        .run_process_command(
            &caller,
            &id,
            &request.command_id,
            request.parameters,
        )
        .await?;
    Ok(Json(json!({ "dispatched": request.command_id })))
}

#[derive(Debug, Deserialize)]
pub struct TextEmbeddingsRequest {
    pub text: String,
}

pub async fn compute_text_embeddings(
    State(state): State<AppState>,
    Json(request): Json<TextEmbeddingsRequest>,
) -> AppResult<Json<Value>> {
    let outcome = state
        .host
        .run_capability(
            Capability::TextEmbeddings,
            json!({ "text": request.text }),
        )
        .await?;
    Ok(Json(json!({
        "extensionId": outcome.extension_id,
        "result": outcome.result,
    })))
}
