//! Pluggable embedding function.

use crate::error::MemoryError;
use async_trait::async_trait;

#[async_trait]
/// Turns record content into an embedding when the caller supplies none.
pub trait Embedder: Send + Sync {
    /// Embed `text`; the result must have the deployment dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}
