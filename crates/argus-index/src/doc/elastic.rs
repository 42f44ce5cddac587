//! Elasticsearch-backed document store over REST.
//!
//! All string fields are indexed as keywords via a dynamic mapping template
//! installed on first start, so term queries are exact matches with no
//! tokenisation.
use crate::doc::query::{Query, SearchBody};
use crate::doc::store::{
    BulkSummary, DocumentStore, SearchResponse, StoreError, StoreResult, record_store_error,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub addresses: Vec<String>,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ElasticDocumentStore {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticDocumentStore {
    pub fn new(config: ElasticConfig) -> StoreResult<Self> {
        let base_url = config
            .addresses
            .first()
            .ok_or_else(|| StoreError::Rejected("no elasticsearch address configured".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            index: config.index,
            username: config.username,
            password: config.password,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    /// Creates the index with the keyword dynamic-mapping template when it
    /// does not exist yet.
    pub async fn ensure_index(&self) -> StoreResult<()> {
        let response = self
            .request(reqwest::Method::HEAD, &format!("/{}", self.index))
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                let mapping = json!({
                    "mappings": {
                        "dynamic_templates": [{
                            "strings": {
                                "match_mapping_type": "string",
                                "mapping": {"type": "keyword"}
                            }
                        }]
                    }
                });
                let response = self
                    .request(reqwest::Method::PUT, &format!("/{}", self.index))
                    .json(&mapping)
                    .send()
                    .await
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(StoreError::Rejected(format!(
                        "create index {} failed: {}",
                        self.index,
                        response.status()
                    )))
                }
            }
            status => Err(StoreError::Rejected(format!(
                "index existence check failed: {status}"
            ))),
        }
    }

    async fn bulk(&self, body: String) -> StoreResult<Value> {
        let response = self
            .request(reqwest::Method::POST, &format!("/{}/_bulk", self.index))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Rejected(format!(
                "bulk request failed: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    fn summarise_bulk(result: &Value, op: &str) -> BulkSummary {
        let mut summary = BulkSummary::default();
        let Some(items) = result["items"].as_array() else {
            return summary;
        };
        for item in items {
            let status = item[op]["status"].as_u64().unwrap_or(0);
            match status {
                200..=299 => summary.succeeded += 1,
                404 => summary.not_found += 1,
                _ => {
                    summary.failed += 1;
                    record_store_error("bulk_item");
                    warn!(%op, status, error = %item[op]["error"], "bulk item failed");
                }
            }
        }
        summary
    }
}

#[async_trait]
impl DocumentStore for ElasticDocumentStore {
    async fn bulk_index(&self, docs: Vec<(i64, Value)>) -> StoreResult<BulkSummary> {
        if docs.is_empty() {
            return Ok(BulkSummary::default());
        }
        let mut body = String::new();
        for (id, doc) in &docs {
            body.push_str(&json!({"index": {"_index": self.index, "_id": id}}).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let result = self.bulk(body).await?;
        Ok(Self::summarise_bulk(&result, "index"))
    }

    async fn bulk_delete(&self, ids: &[i64]) -> StoreResult<BulkSummary> {
        if ids.is_empty() {
            return Ok(BulkSummary::default());
        }
        let mut body = String::new();
        for id in ids {
            body.push_str(&json!({"delete": {"_index": self.index, "_id": id}}).to_string());
            body.push('\n');
        }
        let result = self.bulk(body).await?;
        Ok(Self::summarise_bulk(&result, "delete"))
    }

    async fn msearch(&self, searches: &[SearchBody]) -> StoreResult<Vec<SearchResponse>> {
        let mut body = String::new();
        for search in searches {
            body.push_str("{}\n");
            body.push_str(&search.to_es().to_string());
            body.push('\n');
        }
        let response = self
            .request(reqwest::Method::POST, &format!("/{}/_msearch", self.index))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Rejected(format!(
                "msearch failed: {}",
                response.status()
            )));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let empty = Vec::new();
        let responses = result["responses"].as_array().unwrap_or(&empty);
        Ok(responses
            .iter()
            .map(|response| SearchResponse {
                hits: response["hits"]["hits"]
                    .as_array()
                    .unwrap_or(&empty)
                    .iter()
                    .map(|hit| hit["_source"].clone())
                    .collect(),
            })
            .collect())
    }

    async fn delete_by_query(&self, query: &Query) -> StoreResult<u64> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/{}/_delete_by_query", self.index),
            )
            .json(&json!({"query": query.to_es()}))
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Rejected(format!(
                "delete_by_query failed: {}",
                response.status()
            )));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(result["deleted"].as_u64().unwrap_or(0))
    }

    async fn count(&self, query: &Query) -> StoreResult<u64> {
        let response = self
            .request(reqwest::Method::POST, &format!("/{}/_count", self.index))
            .json(&json!({"query": query.to_es()}))
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Rejected(format!(
                "count failed: {}",
                response.status()
            )));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(result["count"].as_u64().unwrap_or(0))
    }

    async fn ping(&self) -> StoreResult<()> {
        let response = self
            .request(reqwest::Method::GET, "/")
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "elasticsearch ping returned {}",
                response.status()
            )))
        }
    }

    fn backend_name(&self) -> &'static str {
        "elasticsearch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use std::net::SocketAddr;

    async fn spawn_fake_es() -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { axum::Json(json!({"name": "fake-es"})) }))
            .route(
                "/argus_policies/_count",
                post(|| async { axum::Json(json!({"count": 3})) }),
            )
            .route(
                "/argus_policies/_bulk",
                post(|body: String| async move {
                    let actions = body.lines().filter(|line| line.contains("delete")).count();
                    let items: Vec<Value> = (0..actions)
                        .map(|i| {
                            json!({"delete": {"status": if i == 0 { 200 } else { 404 }}})
                        })
                        .collect();
                    axum::Json(json!({"errors": false, "items": items}))
                }),
            )
            .route(
                "/argus_policies/_msearch",
                post(|| async {
                    axum::Json(json!({"responses": [
                        {"hits": {"hits": [
                            {"_source": {"subject": {"id": "alice", "type": "user", "name": "", "uid": "user:alice"}}}
                        ]}},
                        {"hits": {"hits": []}}
                    ]}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        addr
    }

    fn store(addr: SocketAddr) -> ElasticDocumentStore {
        ElasticDocumentStore::new(ElasticConfig {
            addresses: vec![format!("http://{addr}")],
            index: "argus_policies".to_string(),
            username: None,
            password: None,
        })
        .expect("store")
    }

    #[tokio::test]
    async fn ping_and_count_round_trip() {
        let addr = spawn_fake_es().await;
        let store = store(addr);
        store.ping().await.expect("ping");
        let count = store.count(&Query::MatchAll).await.expect("count");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn bulk_delete_treats_404_as_not_found() {
        let addr = spawn_fake_es().await;
        let store = store(addr);
        let summary = store.bulk_delete(&[1, 2]).await.expect("bulk delete");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn msearch_extracts_sources() {
        let addr = spawn_fake_es().await;
        let store = store(addr);
        let responses = store
            .msearch(&[
                SearchBody {
                    query: Query::MatchAll,
                    size: 10,
                },
                SearchBody {
                    query: Query::MatchNone,
                    size: 10,
                },
            ])
            .await
            .expect("msearch");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].hits[0]["subject"]["id"], "alice");
        assert!(responses[1].hits.is_empty());
    }
}
