//! Client-facing request handlers
//!
//! Thin adapters from HTTP to the core; all policy lives behind the `Core`
//! methods. Caller certificates arrive base64(DER)-encoded in repeated
//! `x-palisade-client-cert` headers; the deployment's TLS terminator is
//! expected to forward the client chain there.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use palisade_core::secrets::{Secret, UserSecret};
use palisade_core::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::ApiError;
use crate::core::{Core, ManifestInfo, Status};

/// Header carrying one base64(DER) caller certificate per value
pub const CLIENT_CERT_HEADER: &str = "x-palisade-client-cert";

/// Application state shared across handlers
pub struct AppState {
    pub core: Arc<Core>,
}

fn caller_certs(headers: &HeaderMap) -> Result<Vec<Vec<u8>>, ApiError> {
    headers
        .get_all(CLIENT_CERT_HEADER)
        .iter()
        .map(|value| {
            let text = value
                .to_str()
                .map_err(|_| bad_request("client certificate header is not ASCII"))?;
            B64.decode(text.trim())
                .map_err(|_| bad_request("client certificate header is not base64"))
        })
        .collect()
}

fn bad_request(msg: &str) -> ApiError {
    ApiError(CoreError::Invalid(msg.to_string()))
}

/// GET /status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(state.core.status())
}

/// GET /manifest
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ManifestInfo>, ApiError> {
    Ok(Json(state.core.manifest_info()?))
}

/// POST /manifest response
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetManifestResponse {
    /// Party name → base64 RSA-wrapped recovery share
    pub recovery_secrets: BTreeMap<String, String>,
}

/// POST /manifest with the raw manifest as body
pub async fn post_manifest(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SetManifestResponse>, ApiError> {
    let recovery_secrets = state.core.set_manifest(&body)?;
    Ok(Json(SetManifestResponse { recovery_secrets }))
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResponse {
    pub manifest_generation: u64,
}

/// POST /update with the update delta as body; headers carry the signer certs
pub async fn post_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UpdateResponse>, ApiError> {
    let certs = caller_certs(&headers)?;
    let manifest_generation = state.core.update_manifest(&body, &certs)?;
    Ok(Json(UpdateResponse { manifest_generation }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecoverRequest {
    /// Base64 of one decrypted recovery share
    pub recovery_secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecoverResponse {
    pub remaining: usize,
    pub message: String,
}

/// POST /recover
pub async fn post_recover(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecoverRequest>,
) -> Result<Json<RecoverResponse>, ApiError> {
    let share = B64
        .decode(request.recovery_secret.trim())
        .map_err(|_| bad_request("recovery secret is not base64"))?;
    let remaining = state.core.recover(&share)?;
    let message = if remaining == 0 {
        "recovery complete".to_string()
    } else {
        format!("{remaining} recovery share(s) still missing")
    };
    Ok(Json(RecoverResponse { remaining, message }))
}

/// GET /secrets/{name}
pub async fn get_secret(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Secret>, ApiError> {
    let certs = caller_certs(&headers)?;
    Ok(Json(state.core.read_secret(&name, &certs)?))
}

/// POST /secrets/{name}
pub async fn post_secret(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(value): Json<UserSecret>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let certs = caller_certs(&headers)?;
    state.core.write_secret(&name, value, &certs)?;
    Ok(Json(serde_json::json!({})))
}
