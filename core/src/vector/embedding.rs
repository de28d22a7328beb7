//! Embedding provider registry (spec §4.7). Copy-on-write via `ArcSwap`
//! so readers (every `add`/`query`) never block a concurrent registry
//! mutation and vice versa.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::error::EngineError;
use crate::error::Result;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic, network-free provider used by default and in tests.
/// Produces a unit vector derived from a fixed-seed SplitMix64-style hash
/// of the input text's UTF-8 bytes — stable across runs and platforms,
/// unlike `std::hash::Hash`.
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub const DEFAULT_DIMENSION: usize = 32;

    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn text_seed(text: &str) -> u64 {
    let mut hash: u64 = 0xCBF29CE484222325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001B3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut state = text_seed(text);
        let mut values = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            state = splitmix64(state);
            // Map to [-1, 1) for a roughly zero-centered raw vector before normalizing.
            let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
            values.push((unit * 2.0 - 1.0) as f32);
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Ok(values)
    }
}

struct Registration {
    provider: Arc<dyn EmbeddingProvider>,
    reference_count: usize,
}

/// Named registry of embedding providers. Swapped as a whole `HashMap`
/// snapshot on every mutation so concurrent readers always see a
/// consistent view without taking a lock.
pub struct EmbeddingProviderRegistry {
    entries: ArcSwap<HashMap<String, Registration>>,
}

impl Default for EmbeddingProviderRegistry {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(
            "mock-model".to_string(),
            Registration {
                provider: Arc::new(MockEmbeddingProvider::default()),
                reference_count: 0,
            },
        );
        Self {
            entries: ArcSwap::from_pointee(map),
        }
    }
}

impl EmbeddingProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, provider: Arc<dyn EmbeddingProvider>) -> Result<()> {
        let name = name.into();
        let current = self.entries.load();
        if current.contains_key(&name) {
            return Err(EngineError::Conflict(format!(
                "embedding provider {name} already registered"
            )));
        }
        let mut next = (**current).clone_shallow();
        next.insert(
            name,
            Registration {
                provider,
                reference_count: 0,
            },
        );
        self.entries.store(Arc::new(next));
        Ok(())
    }

    /// Fails while any index still references `name`.
    pub fn remove(&self, name: &str) -> Result<()> {
        let current = self.entries.load();
        let Some(registration) = current.get(name) else {
            return Err(EngineError::NotFound(format!("embedding provider {name} not found")));
        };
        if registration.reference_count > 0 {
            return Err(EngineError::Conflict(format!(
                "embedding provider {name} is still referenced by {} index(es)",
                registration.reference_count
            )));
        }
        let mut next = (**current).clone_shallow();
        next.remove(name);
        self.entries.store(Arc::new(next));
        Ok(())
    }

    /// Fails if `provider`'s dimension differs from the existing one while
    /// the provider is still referenced.
    pub fn update(&self, name: &str, provider: Arc<dyn EmbeddingProvider>) -> Result<()> {
        let current = self.entries.load();
        let existing = current
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("embedding provider {name} not found")))?;
        if existing.reference_count > 0 && existing.provider.dimension() != provider.dimension() {
            return Err(EngineError::Conflict(format!(
                "embedding provider {name} dimension cannot change while referenced"
            )));
        }
        let mut next = (**current).clone_shallow();
        let reference_count = existing.reference_count;
        next.insert(
            name.to_string(),
            Registration {
                provider,
                reference_count,
            },
        );
        self.entries.store(Arc::new(next));
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.load().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.entries.load().get(name).map(|r| Arc::clone(&r.provider))
    }

    pub fn acquire(&self, name: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        loop {
            let current = self.entries.load();
            let Some(registration) = current.get(name) else {
                return Err(EngineError::NotFound(format!("embedding provider {name} not found")));
            };
            let provider = Arc::clone(&registration.provider);
            let mut next = (**current).clone_shallow();
            if let Some(entry) = next.get_mut(name) {
                entry.reference_count += 1;
            }
            let swapped = self
                .entries
                .compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&swapped, &current) {
                return Ok(provider);
            }
        }
    }

    pub fn release(&self, name: &str) {
        loop {
            let current = self.entries.load();
            if !current.contains_key(name) {
                return;
            }
            let mut next = (**current).clone_shallow();
            if let Some(entry) = next.get_mut(name) {
                entry.reference_count = entry.reference_count.saturating_sub(1);
            }
            let swapped = self
                .entries
                .compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&swapped, &current) {
                return;
            }
        }
    }
}

trait CloneShallow {
    fn clone_shallow(&self) -> Self;
}

impl CloneShallow for HashMap<String, Registration> {
    fn clone_shallow(&self) -> Self {
        self.iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    Registration {
                        provider: Arc::clone(&v.provider),
                        reference_count: v.reference_count,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn mock_provider_is_deterministic() {
        let provider = MockEmbeddingProvider::default();
        let a = provider.embed("hello world").await.expect("embed");
        let b = provider.embed("hello world").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), MockEmbeddingProvider::DEFAULT_DIMENSION);
    }

    #[test]
    fn builtin_mock_model_is_preregistered() {
        let registry = EmbeddingProviderRegistry::new();
        assert!(registry.list().contains(&"mock-model".to_string()));
    }

    #[test]
    fn cannot_remove_referenced_provider() {
        let registry = EmbeddingProviderRegistry::new();
        registry.acquire("mock-model").expect("acquire");
        let err = registry.remove("mock-model").unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        registry.release("mock-model");
        registry.remove("mock-model").expect("now removable");
    }

    #[test]
    fn duplicate_name_is_conflict() {
        let registry = EmbeddingProviderRegistry::new();
        let err = registry
            .add("mock-model", Arc::new(MockEmbeddingProvider::default()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
