//! Chroma connector over the v1 REST API
//!
//! Collections are addressed by name for lookups and by id for data
//! operations. Fragment text lives in Chroma's `documents` column.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vdm_core::{ConnectorType, Result, VdmError};

use super::{base_url, check_status, http_client, json_body, transport_error};
use crate::{
    Metadata, NamespaceInfo, PageCursor, SimilarityResponse, VectorConnector, VectorMetadata,
    VectorRecord,
};

const BACKEND: &str = "Chroma";
const DEFAULT_AUTH_HEADER: &str = "X-Api-Key";

/// Connector settings as stored for a Chroma organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaSettings {
    #[serde(rename = "instanceURL", alias = "instanceUrl")]
    pub instance_url: String,

    #[serde(rename = "authToken", default)]
    pub auth_token: Option<String>,

    #[serde(rename = "authTokenHeader", default)]
    pub auth_token_header: Option<String>,
}

impl ChromaSettings {
    /// Header name and value to authenticate with, if a token is set
    pub fn auth_header(&self) -> Option<(String, String)> {
        let token = self.auth_token.as_ref().filter(|t| !t.is_empty())?;
        let header = self
            .auth_token_header
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string());
        let value = if header == "Authorization" {
            format!("Bearer {token}")
        } else {
            token.clone()
        };
        Some((header, value))
    }
}

/// Map a Chroma distance to a similarity score in [0, 1]
pub fn distance_to_score(distance: Option<f32>) -> f32 {
    match distance {
        Some(d) if d.is_finite() => (1.0 - d).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

#[derive(Debug, Deserialize)]
struct Collection {
    id: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct GetResult {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    embeddings: Option<Vec<Option<Vec<f64>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
}

impl GetResult {
    fn into_records(self) -> Vec<VectorRecord> {
        let mut embeddings = self.embeddings.unwrap_or_default().into_iter();
        let mut metadatas = self.metadatas.unwrap_or_default().into_iter();
        let mut documents = self.documents.unwrap_or_default().into_iter();

        self.ids
            .into_iter()
            .map(|id| {
                let values = embeddings.next().flatten().unwrap_or_default();
                let metadata = metadatas.next().flatten().unwrap_or_default();
                let document = documents.next().flatten();
                VectorRecord::new(id, values, with_text(metadata, document))
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct QueryResult {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
}

/// Restore the fragment text into metadata under `text`
fn with_text(mut metadata: Metadata, document: Option<String>) -> Metadata {
    if let Some(text) = document {
        metadata
            .entry("text".to_string())
            .or_insert(Value::String(text));
    }
    metadata
}

/// Chroma only stores scalar metadata values
fn scalar_metadata(metadata: &Metadata) -> Metadata {
    crate::flatten_metadata(metadata)
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::Array(_) => Some((key, Value::String(value.to_string()))),
            scalar => Some((key, scalar)),
        })
        .collect()
}

/// Chroma connector
pub struct ChromaConnector {
    client: Client,
    base_url: String,
    settings: ChromaSettings,
}

impl ChromaConnector {
    pub fn new(settings: ChromaSettings) -> Result<Self> {
        if settings.instance_url.trim().is_empty() {
            return Err(VdmError::misconfigured("Chroma instanceURL is required"));
        }

        Ok(Self {
            client: http_client()?,
            base_url: base_url(&settings.instance_url),
            settings,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/v1{path}", self.base_url))
            .header("accept", "application/json");
        match self.settings.auth_header() {
            Some((name, value)) => builder.header(name, value),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn collections(&self) -> Result<Vec<Collection>> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/collections"))
            .await?;
        json_body(BACKEND, response).await
    }

    /// Resolve a collection by name; lookup failures mean "absent"
    async fn collection(&self, name: &str) -> Result<Option<Collection>> {
        let response = self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{name}")))
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(response.json::<Collection>().await.ok())
    }

    async fn require_collection(&self, name: &str) -> Result<Collection> {
        self.collection(name)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("Chroma collection {name}")))
    }

    async fn count(&self, collection_id: &str) -> Result<u64> {
        let response = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("/collections/{collection_id}/count"),
            ))
            .await?;
        json_body(BACKEND, response).await
    }

    async fn post(&self, collection_id: &str, action: &str, body: Value) -> Result<reqwest::Response> {
        let response = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection_id}/{action}"),
                )
                .json(&body),
            )
            .await?;
        check_status(BACKEND, response).await
    }

    async fn get(&self, collection_id: &str, body: Value) -> Result<Vec<VectorRecord>> {
        let result: GetResult = self
            .post(collection_id, "get", body)
            .await?
            .json()
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Chroma: invalid get response: {e}")))?;
        Ok(result.into_records())
    }

    fn submission(records: &[VectorRecord]) -> Value {
        json!({
            "ids": records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "embeddings": records.iter().map(|r| &r.values).collect::<Vec<_>>(),
            "metadatas": records.iter().map(|r| scalar_metadata(&r.metadata)).collect::<Vec<_>>(),
            "documents": records.iter().map(|r| r.text().unwrap_or_default()).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl VectorConnector for ChromaConnector {
    fn kind(&self) -> ConnectorType {
        ConnectorType::Chroma
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/heartbeat"))
            .await?;
        if !response.status().is_success() {
            return Err(VdmError::unreachable(format!(
                "Chroma: invalid heartbeat received ({}), is the instance online?",
                response.status()
            )));
        }
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let mut namespaces = Vec::new();
        for collection in self.collections().await? {
            let vector_count = self.count(&collection.id).await?;
            namespaces.push(NamespaceInfo {
                name: collection.name,
                vector_count,
            });
        }
        Ok(namespaces)
    }

    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        let Some(collection) = self.collection(name).await? else {
            return Ok(None);
        };
        Ok(Some(NamespaceInfo {
            vector_count: self.count(&collection.id).await?,
            name: collection.name,
        }))
    }

    async fn create_namespace(&self, name: &str, _dimensions: usize) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::POST, "/collections").json(&json!({
                "name": name,
                "metadata": { "hnsw:space": "cosine" },
                "get_or_create": true,
            })))
            .await?;
        check_status(BACKEND, response).await?;
        tracing::info!(collection = name, "Chroma collection created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::DELETE, &format!("/collections/{name}")))
            .await?;
        check_status(BACKEND, response).await?;
        tracing::info!(collection = name, "Chroma collection deleted");
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let collection = self.require_collection(namespace).await?;
        self.post(&collection.id, "upsert", Self::submission(records))
            .await?;
        Ok(())
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection = self.require_collection(namespace).await?;
        self.post(&collection.id, "delete", json!({ "ids": ids }))
            .await?;
        Ok(())
    }

    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()> {
        let collection = self.require_collection(namespace).await?;
        self.post(
            &collection.id,
            "update",
            Self::submission(std::slice::from_ref(record)),
        )
        .await?;
        Ok(())
    }

    /// Chroma merges metadata on update, so keys missing from the new
    /// metadata are nulled out. The fragment text is always kept.
    async fn replace_metadata(
        &self,
        namespace: &str,
        existing: &VectorRecord,
        metadata: &Metadata,
    ) -> Result<()> {
        let collection = self.require_collection(namespace).await?;

        let mut replacement: Metadata = crate::flatten_metadata(&existing.metadata)
            .into_iter()
            .map(|(key, _)| (key, Value::Null))
            .collect();
        replacement.extend(scalar_metadata(metadata));
        if let Some(text) = existing.text() {
            replacement.insert("text".to_string(), Value::String(text.to_string()));
        }

        self.post(
            &collection.id,
            "update",
            json!({
                "ids": [existing.id],
                "metadatas": [replacement],
                "documents": [existing.text().unwrap_or_default()],
            }),
        )
        .await?;
        Ok(())
    }

    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>> {
        let Some(collection) = self.collection(namespace).await? else {
            return Ok(None);
        };
        let records = self
            .get(
                &collection.id,
                json!({ "ids": [id], "include": ["embeddings", "metadatas", "documents"] }),
            )
            .await?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse> {
        let collection = self.require_collection(namespace).await?;
        let result: QueryResult = self
            .post(
                &collection.id,
                "query",
                json!({
                    "query_embeddings": [query],
                    "n_results": top_k,
                    "include": ["metadatas", "documents", "distances"],
                }),
            )
            .await?
            .json()
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Chroma: invalid query response: {e}")))?;

        let ids = result.ids.into_iter().next().unwrap_or_default();
        let mut distances = result
            .distances
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default()
            .into_iter();
        let mut metadatas = result
            .metadatas
            .and_then(|m| m.into_iter().next())
            .unwrap_or_default()
            .into_iter();
        let mut documents = result
            .documents
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default()
            .into_iter();

        let mut response = SimilarityResponse::default();
        for id in ids {
            let text = documents.next().flatten().unwrap_or_default();
            let metadata = metadatas.next().flatten().unwrap_or_default();
            let score = distance_to_score(distances.next().flatten());
            response.push(id, text, metadata, score);
        }
        Ok(response)
    }

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>> {
        let collection = self.require_collection(namespace).await?;
        let records = self
            .get(
                &collection.id,
                json!({ "ids": ids, "include": ["metadatas", "documents"] }),
            )
            .await?;

        Ok(records
            .into_iter()
            .map(|r| VectorMetadata {
                vector_id: r.id,
                metadata: r.metadata,
            })
            .collect())
    }

    async fn index_dimensions(&self, namespace: &str) -> Result<usize> {
        let collection = self.require_collection(namespace).await?;
        let records = self
            .get(&collection.id, json!({ "limit": 1, "include": ["embeddings"] }))
            .await?;
        Ok(records.first().map(|r| r.values.len()).unwrap_or(0))
    }

    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>> {
        let collection = self.require_collection(namespace).await?;
        let offset: usize = cursor
            .offset
            .as_deref()
            .and_then(|o| o.parse().ok())
            .unwrap_or(0);

        let records = self
            .get(
                &collection.id,
                json!({
                    "limit": cursor.page_size,
                    "offset": offset,
                    "include": ["embeddings", "metadatas", "documents"],
                }),
            )
            .await?;

        cursor.offset = Some((offset + records.len()).to_string());
        cursor.pages += 1;
        Ok(records)
    }
}
