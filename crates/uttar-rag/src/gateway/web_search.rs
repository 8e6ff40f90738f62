//! HTTP web search gateway for Tavily-style search endpoints.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{WebSearchGateway, WebSearchHit, WebSearchRequest};

pub struct HttpWebSearchGateway {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    score: f32,
}

impl HttpWebSearchGateway {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(45))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/search", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl WebSearchGateway for HttpWebSearchGateway {
    async fn search(&self, request: &WebSearchRequest) -> Result<Vec<WebSearchHit>> {
        let mut body = json!({
            "api_key": self.api_key,
            "query": request.query,
            "max_results": request.max_results.max(1),
        });

        // Filters are forwarded verbatim; the provider interprets them.
        if let Some(topic) = &request.topic {
            body["topic"] = json!(topic);
        }
        if let Some(time_range) = &request.time_range {
            body["time_range"] = json!(time_range);
        }
        if let Some(start_date) = &request.start_date {
            body["start_date"] = json!(start_date);
        }
        if let Some(end_date) = &request.end_date {
            body["end_date"] = json!(end_date);
        }
        if let Some(country) = &request.country {
            body["country"] = json!(country);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Web search to {} timed out", self.endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Web search to {} failed: {}", self.endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("Web search error ({}): {}", status, error));
        }

        let parsed: SearchResponse =
            super::completion::parse_json_response(response, &self.endpoint).await?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| WebSearchHit {
                title: r.title,
                url: r.url,
                content: r.content,
                published_date: r.published_date,
                author: r.author,
                score: r.score,
            })
            .collect())
    }
}
