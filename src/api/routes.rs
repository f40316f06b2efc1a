use axum::{extract::DefaultBodyLimit, routing::post, Router};
use burn::tensor::backend::Backend;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api::{handlers, state::AppState};

pub fn create_router<B: Backend>(state: AppState<B>, max_upload_bytes: usize) -> Router {
    // Any origin may call the API
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/predict", post(handlers::predict::<B>))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
