//! Ollama-compatible embedding provider (spec §4.7), the concrete
//! `EmbeddingProvider` the registry falls back to when a tenant wants real
//! embeddings instead of `mock-model`.

mod client;

pub use client::OllamaEmbeddingClient;
