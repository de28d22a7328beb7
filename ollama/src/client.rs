use async_trait::async_trait;
use engine_core::EngineError;
use engine_core::Result;

use engine_core::vector::embedding::EmbeddingProvider;

const TAGS_PATH: &str = "/api/tags";
const EMBEDDINGS_PATH: &str = "/api/embeddings";

/// Client for an Ollama-compatible `/api/embeddings` endpoint, following the
/// teacher's `OllamaClient`'s probe-then-use shape: verify the server is
/// reachable at construction time, then serve `embed` calls against the
/// already-validated host root.
#[derive(Debug)]
pub struct OllamaEmbeddingClient {
    client: reqwest::Client,
    host_root: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbeddingClient {
    /// Probes the server and issues one embedding call to learn the model's
    /// dimension, so later `dimension()` calls (needed by the vector index
    /// before the first document is ever embedded) don't round-trip.
    pub async fn try_new(host_root: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let host_root = host_root.into();
        let model = model.into();
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::EmbeddingProviderError(format!("failed to build HTTP client: {e}")))?;

        probe_server(&client, &host_root).await?;

        let mut provider = Self { client, host_root, model, dimension: 0 };
        let probe_vector = provider.embed_raw("ping").await?;
        provider.dimension = probe_vector.len();
        Ok(provider)
    }

    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}{EMBEDDINGS_PATH}", self.host_root.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({"model": self.model, "prompt": text}))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(EngineError::EmbeddingProviderError(format!(
                "ollama embeddings request failed: HTTP {status}"
            )));
        }
        let body: serde_json::Value = response.json().await?;
        let values = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                EngineError::EmbeddingProviderError("ollama response missing 'embedding' array".to_string())
            })?;
        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EngineError::EmbeddingProviderError("non-numeric embedding entry".to_string()))
            })
            .collect()
    }
}

async fn probe_server(client: &reqwest::Client, host_root: &str) -> Result<()> {
    let url = format!("{}{TAGS_PATH}", host_root.trim_end_matches('/'));
    let response = client.get(url).send().await.map_err(|e| {
        tracing::warn!("failed to connect to ollama server at {host_root}: {e}");
        EngineError::EmbeddingProviderError(format!(
            "no reachable ollama server at {host_root}; start it with `ollama serve`"
        ))
    })?;
    if response.status().is_success() {
        Ok(())
    } else {
        tracing::warn!("ollama probe at {host_root} returned HTTP {}", response.status());
        Err(EngineError::EmbeddingProviderError(format!(
            "ollama server at {host_root} is unreachable"
        )))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_raw(text).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[tokio::test]
    async fn try_new_discovers_dimension_from_probe_embedding() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(EMBEDDINGS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3]})))
            .mount(&server)
            .await;

        let client = OllamaEmbeddingClient::try_new(server.uri(), "nomic-embed-text").await.expect("client");
        assert_eq!(client.dimension(), 3);
    }

    #[tokio::test]
    async fn embed_surfaces_http_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGS_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = OllamaEmbeddingClient::try_new(server.uri(), "nomic-embed-text").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingProviderError(_)));
    }

    #[tokio::test]
    async fn embed_rejects_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(EMBEDDINGS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"oops": true})))
            .mount(&server)
            .await;

        let err = OllamaEmbeddingClient::try_new(server.uri(), "nomic-embed-text").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingProviderError(_)));
    }
}
