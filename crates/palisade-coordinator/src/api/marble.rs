//! Marble-facing request handlers
//!
//! The two methods of the marble surface, `Activate` and `GetQuote`,
//! adapted to the mesh listener. Framing is deliberately minimal: the
//! protocol is whatever the deployment's premain speaks, and these
//! handlers only decode blobs and delegate to the core.

use axum::extract::State;
use axum::Json;
use palisade_core::manifest::Parameters;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use super::handlers::AppState;
use crate::core::{ActivationRequest, QuoteResponse};

/// POST /activate body
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateRequest {
    /// Base64 platform quote over the hash of the CSR public key
    #[serde(with = "crate::core::b64_bytes")]
    pub quote: Vec<u8>,
    /// Base64 DER certificate signing request
    #[serde(rename = "CSR", with = "crate::core::b64_bytes")]
    pub csr: Vec<u8>,
    /// Marble-chosen activation UUID
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    pub marble_type: String,
}

/// POST /activate response
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    /// PEM leaf certificate for this marble
    pub certificate: String,
    pub parameters: Parameters,
    pub root_cert: String,
}

/// POST /activate
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, ApiError> {
    let response = state.core.activate(ActivationRequest {
        quote: request.quote,
        csr_der: request.csr,
        uuid: request.uuid,
        marble_type: request.marble_type,
        deadline: None,
    })?;
    Ok(Json(ActivateResponse {
        certificate: response.certificate,
        parameters: response.parameters,
        root_cert: response.root_cert,
    }))
}

/// GET /quote, the Coordinator attesting itself
pub async fn quote(State(state): State<Arc<AppState>>) -> Result<Json<QuoteResponse>, ApiError> {
    Ok(Json(state.core.get_quote()?))
}
