//! Request handlers for the receiver API.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;
use lanvault_common::Error;
use lanvault_protocol::{
    PairingHandler, PrepareUploadRequest, PrepareUploadResponse, RegisterRequest,
    RegisterResponse, TransferService, UploadResponse,
};

/// Shared state of the router.
#[derive(Clone)]
pub struct AppState {
    pub pairing: Arc<PairingHandler>,
    pub transfers: Arc<TransferService>,
}

/// Query string of `PUT /api/v1/upload`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadParams {
    pub session_id: String,
    pub transmission_id: String,
    pub file_id: String,
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    ApiError(Error::InvalidInput(e.to_string()))
}

/// `POST /api/v1/register`
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(request) = body.map_err(bad_request)?;
    let response = state.pairing.register(request).await?;
    Ok(Json(response))
}

/// `POST /api/v1/prepare-upload`
pub async fn prepare_upload(
    State(state): State<AppState>,
    body: Result<Json<PrepareUploadRequest>, JsonRejection>,
) -> Result<Json<PrepareUploadResponse>, ApiError> {
    let Json(request) = body.map_err(bad_request)?;
    let response = state.transfers.prepare_upload(request).await?;
    Ok(Json(response))
}

/// `PUT /api/v1/upload?sessionId&transmissionId&fileId`
///
/// The body is either `multipart/form-data` (field `file`, else the first
/// field) or the raw file bytes. It is only read once the transfer record
/// accepts the upload.
pub async fn upload(
    State(state): State<AppState>,
    params: Result<Query<UploadParams>, QueryRejection>,
    request: Request,
) -> Result<Json<UploadResponse>, ApiError> {
    let Query(params) = params.map_err(bad_request)?;
    if params.session_id.is_empty()
        || params.transmission_id.is_empty()
        || params.file_id.is_empty()
    {
        return Err(bad_request(
            "sessionId, transmissionId and fileId are required",
        ));
    }

    state.transfers.check_upload(
        &params.session_id,
        &params.transmission_id,
        &params.file_id,
    )?;

    let data = read_upload_body(request).await?;
    debug!(
        transmission = %params.transmission_id,
        bytes = data.len(),
        "Upload body received"
    );

    let response = state
        .transfers
        .upload(
            &params.session_id,
            &params.transmission_id,
            &params.file_id,
            data,
        )
        .await?;
    Ok(Json(response))
}

async fn read_upload_body(request: Request) -> Result<Vec<u8>, ApiError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if !is_multipart {
        let bytes = Bytes::from_request(request, &()).await.map_err(bad_request)?;
        return Ok(bytes.to_vec());
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(bad_request)?;
    let mut first = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let is_file = field.name() == Some("file");
        let data = field.bytes().await.map_err(bad_request)?;
        if is_file {
            return Ok(data.to_vec());
        }
        if first.is_none() {
            first = Some(data);
        }
    }

    first
        .map(|data| data.to_vec())
        .ok_or_else(|| bad_request("Multipart body has no file field"))
}
