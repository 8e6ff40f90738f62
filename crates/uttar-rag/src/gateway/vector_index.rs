//! HTTP vector index gateway for Pinecone-style query endpoints.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{VectorFilter, VectorHit, VectorIndexGateway};

pub struct HttpVectorIndexGateway {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl HttpVectorIndexGateway {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(30))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/query", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Placeholder gateway for deployments without a vector index; dense
    /// retrieval becomes a no-op.
    pub fn unconfigured() -> Self {
        Self {
            client: Client::new(),
            endpoint: String::new(),
            api_key: String::new(),
        }
    }

    fn build_filter(filter: &VectorFilter) -> serde_json::Value {
        let mut conditions = serde_json::Map::new();
        conditions.insert("userId".to_string(), json!({"$eq": filter.user_id}));
        if let Some(topic_id) = &filter.topic_id {
            conditions.insert("topicId".to_string(), json!({"$eq": topic_id}));
        }
        if let Some(document_ids) = &filter.document_ids {
            conditions.insert("documentId".to_string(), json!({"$in": document_ids}));
        }
        serde_json::Value::Object(conditions)
    }

    fn meta_str(metadata: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
        metadata.get(key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }
}

#[async_trait]
impl VectorIndexGateway for HttpVectorIndexGateway {
    fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        if !self.is_configured() {
            return Err(anyhow!("vector index endpoint is not configured"));
        }

        let request = json!({
            "vector": vector,
            "topK": top_k,
            "filter": Self::build_filter(filter),
            "includeMetadata": true,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Vector query to {} timed out", self.endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Vector query to {} failed: {}", self.endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("Vector index error ({}): {}", status, error));
        }

        let parsed: QueryResponse =
            super::completion::parse_json_response(response, &self.endpoint).await?;

        let hits = parsed
            .matches
            .into_iter()
            .map(|m| {
                let document_id =
                    Self::meta_str(&m.metadata, "documentId").unwrap_or_default();
                let content = Self::meta_str(&m.metadata, "content").unwrap_or_default();
                let chunk_index = m
                    .metadata
                    .get("chunkIndex")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;

                let mut metadata: HashMap<String, String> = HashMap::new();
                for (key, value) in &m.metadata {
                    if key == "content" {
                        continue;
                    }
                    match value {
                        serde_json::Value::String(s) => {
                            metadata.insert(key.clone(), s.clone());
                        }
                        other => {
                            metadata.insert(key.clone(), other.to_string());
                        }
                    }
                }

                VectorHit {
                    chunk_id: m.id,
                    document_id,
                    content,
                    chunk_index,
                    score: m.score,
                    metadata,
                }
            })
            .collect();

        Ok(hits)
    }
}
