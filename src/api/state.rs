use std::sync::Arc;

use burn::tensor::backend::Backend;

use crate::ml::InferenceEngine;

/// Shared application state for API handlers
pub struct AppState<B: Backend> {
    /// `None` when the artifact failed to load at startup
    pub engine: Option<Arc<InferenceEngine<B>>>,
}

impl<B: Backend> AppState<B> {
    pub fn new(engine: Option<InferenceEngine<B>>) -> Self {
        Self {
            engine: engine.map(Arc::new),
        }
    }
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}
