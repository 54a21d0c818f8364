//! Test helpers shared across Mnemos crates.

pub mod backend;
pub mod embedder;
pub mod harness;

pub use backend::FaultyBackend;
pub use embedder::{FailingEmbedder, StubEmbedder};
pub use harness::{Harness, TEST_DIMENSION, request};
