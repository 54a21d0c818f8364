use async_trait::async_trait;
use mnemos_rs_memory::{Embedder, MemoryError};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Deterministic embedder: known texts map to fixed vectors, anything else
/// to a vector derived from its bytes.
#[derive(Debug, Default)]
pub struct StubEmbedder {
    dimension: usize,
    fixed: HashMap<String, Vec<f32>>,
    calls: Mutex<Vec<String>>,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    pub fn with(mut self, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), embedding);
        self
    }

    /// Texts embedded so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        self.calls.lock().push(text.to_string());
        if let Some(embedding) = self.fixed.get(text) {
            return Ok(embedding.clone());
        }
        let mut embedding = vec![0.0; self.dimension];
        for (index, byte) in text.bytes().enumerate() {
            if let Some(slot) = embedding.get_mut(index % self.dimension.max(1)) {
                *slot += f32::from(byte) / 255.0;
            }
        }
        if embedding.iter().all(|value| *value == 0.0) {
            if let Some(first) = embedding.first_mut() {
                *first = 1.0;
            }
        }
        Ok(embedding)
    }
}

/// Embedder that always fails.
#[derive(Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
        Err(MemoryError::Embedding("embedding service offline".to_string()))
    }
}
