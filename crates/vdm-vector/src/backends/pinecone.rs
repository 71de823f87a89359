//! Pinecone connector over the controller and data-plane REST APIs
//!
//! Pinecone has no pagination, so full scans tag every seen vector with the
//! run marker and exclude tagged vectors on the next query. The free starter
//! tier only holds the default namespace and needs a pause after writes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use vdm_core::{ConnectorType, Result, VdmError};

use super::{base_url, check_status, http_client, json_body, transport_error};
use crate::{
    Metadata, NamespaceInfo, PageCursor, SimilarityResponse, VectorConnector, VectorMetadata,
    VectorRecord, DELETE_CHUNK_SIZE, RUN_MARKER_KEY, TAGGING_PAGE_SIZE, UPSERT_CHUNK_SIZE,
};

const BACKEND: &str = "Pinecone";
const STARTER_ENVIRONMENT: &str = "gcp-starter";

/// Connector settings as stored for a Pinecone organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PineconeSettings {
    pub api_key: String,
    pub environment: String,
    pub index: String,
}

impl PineconeSettings {
    pub fn is_starter_tier(&self) -> bool {
        self.environment == STARTER_ENVIRONMENT
    }
}

#[derive(Debug, Deserialize)]
struct IndexDescription {
    status: IndexStatus,
}

#[derive(Debug, Deserialize)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexStats {
    #[serde(default)]
    namespaces: HashMap<String, NamespaceStats>,
    #[serde(default)]
    dimension: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceStats {
    #[serde(default)]
    vector_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<Match>,
}

#[derive(Debug, Deserialize)]
struct Match {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Default, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    vectors: HashMap<String, FetchedVector>,
}

#[derive(Debug, Deserialize)]
struct FetchedVector {
    id: String,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

impl From<FetchedVector> for VectorRecord {
    fn from(v: FetchedVector) -> Self {
        VectorRecord::new(v.id, v.values, v.metadata.unwrap_or_default())
    }
}

/// Pinecone connector
pub struct PineconeConnector {
    client: Client,
    settings: PineconeSettings,
    controller_url: String,
    starter_delay: Duration,
    host: OnceCell<String>,
}

impl PineconeConnector {
    pub fn new(settings: PineconeSettings) -> Result<Self> {
        if settings.api_key.is_empty() || settings.index.is_empty() {
            return Err(VdmError::misconfigured(
                "Pinecone apiKey and index are required",
            ));
        }

        let controller_url = format!("https://controller.{}.pinecone.io", settings.environment);
        Ok(Self {
            client: http_client()?,
            settings,
            controller_url,
            starter_delay: Duration::from_secs(15),
            host: OnceCell::new(),
        })
    }

    /// Override the controller endpoint
    pub fn with_controller_url(mut self, url: impl Into<String>) -> Self {
        self.controller_url = base_url(&url.into());
        self
    }

    /// Pause applied after writes on the starter tier
    pub fn with_starter_delay(mut self, delay: Duration) -> Self {
        self.starter_delay = delay;
        self
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Api-Key", &self.settings.api_key)
            .header("accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        self.authed(builder)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn describe_index(&self) -> Result<IndexDescription> {
        let url = format!("{}/databases/{}", self.controller_url, self.settings.index);
        let response = self.send(self.client.get(url)).await?;
        json_body(BACKEND, response).await
    }

    /// Resolve and cache the data-plane host of a ready index
    async fn data_host(&self) -> Result<&str> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let description = self.describe_index().await?;
                match (description.status.ready, description.status.host) {
                    (true, Some(host)) if !host.is_empty() => Ok(if host.starts_with("http") {
                        base_url(&host)
                    } else {
                        format!("https://{host}")
                    }),
                    _ => Err(VdmError::unreachable(format!(
                        "Pinecone index {} not ready",
                        self.settings.index
                    ))),
                }
            })
            .await?;
        Ok(host.as_str())
    }

    async fn data_post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/{path}", self.data_host().await?);
        self.send(self.client.post(url).json(body)).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        let response = self.data_post("describe_index_stats", &json!({})).await?;
        json_body(BACKEND, response).await
    }

    /// Query with top-k back-off: HTTP 500 retries with half, then a quarter
    async fn query(&self, mut body: Value, top_k: usize) -> Result<QueryResponse> {
        let mut last_error = String::new();

        for divisor in [1, 2, 4] {
            let k = (top_k / divisor).max(1);
            body["topK"] = json!(k);

            let response = self.data_post("query", &body).await?;
            if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
                last_error = response.text().await.unwrap_or_default();
                tracing::warn!(top_k = k, "Pinecone query failed with HTTP 500, backing off");
                continue;
            }
            return json_body(BACKEND, response).await;
        }

        Err(VdmError::VectorDbError(format!(
            "Pinecone: query failed after back-off: {last_error}"
        )))
    }

    async fn fetch(&self, namespace: &str, ids: &[String]) -> Result<FetchResponse> {
        let url = format!("{}/vectors/fetch", self.data_host().await?);
        let mut params: Vec<(&str, &str)> = ids.iter().map(|id| ("ids", id.as_str())).collect();
        params.push(("namespace", namespace));

        let response = self.send(self.client.get(url).query(&params)).await?;
        json_body(BACKEND, response).await
    }

    async fn set_metadata(&self, namespace: &str, id: &str, metadata: Value) -> Result<()> {
        let response = self
            .data_post(
                "vectors/update",
                &json!({ "id": id, "setMetadata": metadata, "namespace": namespace }),
            )
            .await?;
        check_status(BACKEND, response).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorConnector for PineconeConnector {
    fn kind(&self) -> ConnectorType {
        ConnectorType::Pinecone
    }

    async fn connect(&self) -> Result<()> {
        self.data_host().await?;
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let mut namespaces: Vec<NamespaceInfo> = self
            .stats()
            .await?
            .namespaces
            .into_iter()
            .map(|(name, stats)| NamespaceInfo {
                name,
                vector_count: stats.vector_count,
            })
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        Ok(self
            .stats()
            .await?
            .namespaces
            .remove(name)
            .map(|stats| NamespaceInfo {
                name: name.to_string(),
                vector_count: stats.vector_count,
            }))
    }

    async fn create_namespace(&self, name: &str, _dimensions: usize) -> Result<()> {
        if !self.supports_namespace(name) {
            return Err(VdmError::ValidationError(format!(
                "Pinecone starter tier cannot hold namespace {name}"
            )));
        }
        // Namespaces are created implicitly by the first upsert
        tracing::debug!(namespace = name, "Pinecone namespace will be created on first upsert");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        if !self.can_drop_namespaces() {
            return Err(VdmError::ValidationError(
                "Pinecone starter tier cannot delete a whole namespace".to_string(),
            ));
        }

        let response = self
            .data_post(
                "vectors/delete",
                &json!({ "deleteAll": true, "namespace": name }),
            )
            .await?;
        check_status(BACKEND, response).await?;
        tracing::info!(namespace = name, "Pinecone namespace cleared");
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let vectors: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "values": r.values,
                    "metadata": crate::flatten_metadata(&r.metadata),
                })
            })
            .collect();

        let response = self
            .data_post(
                "vectors/upsert",
                &json!({ "vectors": vectors, "namespace": namespace }),
            )
            .await?;
        check_status(BACKEND, response).await?;
        Ok(())
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(UPSERT_CHUNK_SIZE) {
            let response = self
                .data_post(
                    "vectors/delete",
                    &json!({ "ids": chunk, "namespace": namespace }),
                )
                .await?;
            check_status(BACKEND, response).await?;
        }
        Ok(())
    }

    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()> {
        let response = self
            .data_post(
                "vectors/update",
                &json!({
                    "id": record.id,
                    "values": record.values,
                    "setMetadata": crate::flatten_metadata(&record.metadata),
                    "namespace": namespace,
                }),
            )
            .await?;
        check_status(BACKEND, response).await?;
        Ok(())
    }

    /// `setMetadata` only merges keys, so the vector is recreated under the
    /// same id with the new metadata
    async fn replace_metadata(
        &self,
        namespace: &str,
        existing: &VectorRecord,
        metadata: &Metadata,
    ) -> Result<()> {
        self.delete_ids(namespace, std::slice::from_ref(&existing.id))
            .await?;
        let record = VectorRecord::new(
            existing.id.clone(),
            existing.values.clone(),
            metadata.clone(),
        );
        self.upsert_batch(namespace, std::slice::from_ref(&record))
            .await
    }

    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>> {
        let mut fetched = self.fetch(namespace, &[id.to_string()]).await?;
        Ok(fetched.vectors.remove(id).map(VectorRecord::from))
    }

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse> {
        let response = self
            .query(
                json!({
                    "namespace": namespace,
                    "vector": query,
                    "includeMetadata": true,
                }),
                top_k,
            )
            .await?;

        let mut result = SimilarityResponse::default();
        for m in response.matches {
            let metadata = m.metadata.unwrap_or_default();
            let text = metadata
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            result.push(m.id, text, metadata, m.score);
        }
        Ok(result)
    }

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>> {
        let mut fetched = self.fetch(namespace, ids).await?;
        Ok(ids
            .iter()
            .filter_map(|id| fetched.vectors.remove(id))
            .map(|v| VectorMetadata {
                vector_id: v.id,
                metadata: v.metadata.unwrap_or_default(),
            })
            .collect())
    }

    async fn index_dimensions(&self, _namespace: &str) -> Result<usize> {
        Ok(self.stats().await?.dimension)
    }

    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>> {
        let dimensions = match cursor.dimensions {
            Some(d) => d,
            None => {
                let d = self.index_dimensions(namespace).await?;
                cursor.dimensions = Some(d);
                d
            }
        };

        let response = self
            .query(
                json!({
                    "namespace": namespace,
                    "vector": vec![0.0_f32; dimensions],
                    "includeValues": true,
                    "includeMetadata": true,
                    "filter": { RUN_MARKER_KEY: { "$ne": cursor.run_marker } },
                }),
                cursor.page_size,
            )
            .await?;

        cursor.pages += 1;
        Ok(response
            .matches
            .into_iter()
            .map(|m| VectorRecord::new(m.id, m.values, m.metadata.unwrap_or_default()))
            .collect())
    }

    /// Tag ids with the run marker, bounded concurrent single updates
    async fn mark_seen(&self, namespace: &str, ids: &[String], cursor: &PageCursor) -> Result<()> {
        tracing::debug!(namespace, count = ids.len(), run = %cursor.run_marker, "Tagging Pinecone vectors");

        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let updates = chunk.iter().map(|id| {
                self.set_metadata(namespace, id, json!({ RUN_MARKER_KEY: cursor.run_marker }))
            });
            for (id, result) in chunk.iter().zip(join_all(updates).await) {
                if let Err(e) = result {
                    tracing::warn!(vector_id = %id, error = %e, "Failed to tag vector");
                }
            }
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        TAGGING_PAGE_SIZE
    }

    fn supports_namespace(&self, name: &str) -> bool {
        !self.settings.is_starter_tier() || name.is_empty()
    }

    fn has_default_namespace(&self) -> bool {
        true
    }

    fn can_drop_namespaces(&self) -> bool {
        !self.settings.is_starter_tier()
    }

    fn write_delay(&self) -> Option<Duration> {
        self.settings.is_starter_tier().then_some(self.starter_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(environment: &str) -> PineconeSettings {
        PineconeSettings {
            api_key: "pc-key".into(),
            environment: environment.into(),
            index: "main".into(),
        }
    }

    async fn connector(server: &MockServer) -> PineconeConnector {
        Mock::given(method("GET"))
            .and(path("/databases/main"))
            .and(header("Api-Key", "pc-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "database": { "name": "main" },
                "status": { "ready": true, "host": server.uri() }
            })))
            .mount(server)
            .await;

        PineconeConnector::new(settings("us-east1-gcp"))
            .unwrap()
            .with_controller_url(server.uri())
    }

    #[test]
    fn test_starter_tier_constraints() {
        let starter = PineconeConnector::new(settings("gcp-starter"))
            .unwrap()
            .with_starter_delay(Duration::from_millis(5));
        assert!(starter.supports_namespace(""));
        assert!(!starter.supports_namespace("docs"));
        assert_eq!(starter.write_delay(), Some(Duration::from_millis(5)));

        let paid = PineconeConnector::new(settings("us-east1-gcp")).unwrap();
        assert!(paid.supports_namespace("docs"));
        assert_eq!(paid.write_delay(), None);
    }

    #[tokio::test]
    async fn test_index_not_ready_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/databases/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": { "ready": false, "host": null }
            })))
            .mount(&server)
            .await;

        let connector = PineconeConnector::new(settings("us-east1-gcp"))
            .unwrap()
            .with_controller_url(server.uri());
        let err = connector.connect().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_namespaces_from_stats() {
        let server = MockServer::start().await;
        let connector = connector(&server).await;
        Mock::given(method("POST"))
            .and(path("/describe_index_stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "namespaces": { "docs": { "vectorCount": 3 }, "faq": { "vectorCount": 4 } },
                "dimension": 1536,
                "totalVectorCount": 7
            })))
            .mount(&server)
            .await;

        assert_eq!(connector.total_indices().await.unwrap(), 7);
        assert_eq!(
            connector.namespace("faq").await.unwrap().unwrap().vector_count,
            4
        );
        assert_eq!(connector.namespace("missing").await.unwrap(), None);
        assert_eq!(connector.index_dimensions("docs").await.unwrap(), 1536);
    }

    #[tokio::test]
    async fn test_query_backs_off_on_server_error() {
        let server = MockServer::start().await;
        let connector = connector(&server).await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_partial_json(json!({ "topK": 8 })))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_partial_json(json!({ "topK": 4 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "matches": [{ "id": "v1", "score": 0.9, "metadata": { "text": "hi" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = connector
            .similarity_response("docs", &[0.1, 0.2], 8)
            .await
            .unwrap();
        assert_eq!(response.vector_ids, vec!["v1"]);
        assert_eq!(response.context_texts, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_page_query_excludes_run_marker() {
        let server = MockServer::start().await;
        let connector = connector(&server).await;
        let mut cursor = PageCursor::new(2);
        cursor.dimensions = Some(3);

        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_partial_json(json!({
                "topK": 2,
                "vector": [0.0, 0.0, 0.0],
                "filter": { "runId": { "$ne": cursor.run_marker } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "matches": [
                    { "id": "a", "values": [1.0, 0.0, 0.0], "metadata": { "title": "x" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vectors/update"))
            .and(body_partial_json(json!({ "id": "a", "setMetadata": { "runId": cursor.run_marker } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let page = connector.fetch_next_page("docs", &mut cursor).await.unwrap();
        assert_eq!(page.len(), 1);
        connector
            .mark_seen("docs", &["a".to_string()], &cursor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_vector_missing_is_none() {
        let server = MockServer::start().await;
        let connector = connector(&server).await;
        Mock::given(method("GET"))
            .and(path("/vectors/fetch"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "vectors": {}, "namespace": "docs" })),
            )
            .mount(&server)
            .await;

        assert_eq!(connector.fetch_vector("docs", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_metadata_recreates_vector() {
        let server = MockServer::start().await;
        let connector = connector(&server).await;
        Mock::given(method("POST"))
            .and(path("/vectors/delete"))
            .and(body_partial_json(json!({ "ids": ["v1"], "namespace": "docs" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vectors/upsert"))
            .and(body_partial_json(json!({
                "vectors": [{ "id": "v1", "values": [0.5, 0.25], "metadata": { "title": "new" } }],
                "namespace": "docs"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "upsertedCount": 1 })))
            .expect(1)
            .mount(&server)
            .await;

        let existing = VectorRecord::new("v1", vec![0.5, 0.25], Metadata::new());
        let mut metadata = Metadata::new();
        metadata.insert("title".into(), json!("new"));
        connector
            .replace_metadata("docs", &existing, &metadata)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_namespace_refused_on_starter_tier() {
        let starter = PineconeConnector::new(settings("gcp-starter")).unwrap();
        assert!(starter.has_default_namespace());
        assert!(!starter.can_drop_namespaces());
        let err = starter.delete_namespace("").await.unwrap_err();
        assert!(matches!(err, VdmError::ValidationError(_)));

        let server = MockServer::start().await;
        let paid = connector(&server).await;
        Mock::given(method("POST"))
            .and(path("/vectors/delete"))
            .and(body_partial_json(json!({ "deleteAll": true, "namespace": "docs" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        paid.delete_namespace("docs").await.unwrap();
    }
}
