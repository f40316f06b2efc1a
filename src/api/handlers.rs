use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use burn::tensor::backend::Backend;

use crate::api::{error::ApiError, state::AppState};
use crate::types::Prediction;

/// Multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Finds the first `file` part that has a filename attribute
async fn read_upload(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        // without a filename the part is a plain form value
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        if file_name.is_empty() {
            return Err(ApiError::InvalidFilename);
        }
        let bytes = field.bytes().await?;
        return Ok((file_name, bytes));
    }
    Err(ApiError::NoFile)
}

/// POST /predict
pub async fn predict<B: Backend>(
    State(state): State<AppState<B>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let engine = state.engine.clone().ok_or(ApiError::ModelNotLoaded)?;

    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!("Not a multipart request: {}", rejection);
        ApiError::NoFile
    })?;
    let (file_name, bytes) = read_upload(&mut multipart).await?;
    tracing::debug!("Received {} ({} bytes)", file_name, bytes.len());

    let prediction = tokio::task::spawn_blocking(move || engine.predict_bytes(&bytes))
        .await
        .map_err(|e| ApiError::Processing(e.to_string()))?
        .map_err(|e| ApiError::Processing(e.to_string()))?;

    tracing::info!(
        "Prediction for {}: {} ({:.4})",
        file_name,
        prediction.class_name,
        prediction.probability_tuberculosis
    );
    Ok(Json(prediction))
}
