//! VDM Vector - Vector database connectors
//!
//! One capability surface over Chroma, Pinecone, Qdrant and Weaviate, plus
//! the on-disk vector cache and the embedding clients.
//!
//! Author: hephaex@gmail.com

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vdm_core::{ConnectorConfig, ConnectorType, JobsConfig, Result, VdmError};

pub mod backends;
pub mod cache;
pub mod embedding;

pub use backends::{ChromaConnector, PineconeConnector, QdrantConnector, WeaviateConnector};
pub use cache::{CacheEntry, VectorCacheStore};
pub use embedding::{create_embedding_client, EmbeddingClient, OllamaEmbedding, OpenAiEmbedding};

#[cfg(any(test, feature = "test-utils"))]
pub use backends::memory::MemoryConnector;

/// Records per remote upsert call
pub const UPSERT_CHUNK_SIZE: usize = 500;

/// In-flight single deletes for backends without bulk delete
pub const DELETE_CHUNK_SIZE: usize = 50;

/// Page size for backends paginated by run-marker tagging
pub const TAGGING_PAGE_SIZE: usize = 1000;

/// Page size for backends with native offsets or cursors
pub const OFFSET_PAGE_SIZE: usize = 100;

/// Metadata key carrying the sync run marker on tagged vectors
pub const RUN_MARKER_KEY: &str = "runId";

pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Records
// ============================================================================

/// A vector as exchanged with every backend.
///
/// Values are kept at double precision so cached embeddings survive a
/// round trip unchanged; adapters narrow them only where a wire client
/// requires single precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, values: Vec<f64>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            values,
            metadata,
        }
    }

    /// Text carried by the fragment, if any
    pub fn text(&self) -> Option<&str> {
        self.metadata.get("text").and_then(|v| v.as_str())
    }
}

/// A remote namespace/collection/class and its size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub vector_count: u64,
}

/// Similarity search result, positionally aligned, best match first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityResponse {
    pub vector_ids: Vec<String>,
    pub context_texts: Vec<String>,
    pub source_documents: Vec<Metadata>,
    pub scores: Vec<f32>,
}

impl SimilarityResponse {
    fn push(&mut self, id: String, text: String, metadata: Metadata, score: f32) {
        self.vector_ids.push(id);
        self.context_texts.push(text);
        self.source_documents.push(metadata);
        self.scores.push(score);
    }

    pub fn len(&self) -> usize {
        self.vector_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector_ids.is_empty()
    }
}

/// Metadata of one vector, keyed by its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub vector_id: String,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// One failed chunk of a bulk write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub chunk: usize,
    pub ids: Vec<String>,
    pub error: String,
}

/// Outcome of a chunked bulk upsert; partial failures are data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddVectorsOutcome {
    pub inserted: usize,
    pub errors: Vec<BatchFailure>,
}

impl AddVectorsOutcome {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.errors
            .iter()
            .flat_map(|f| f.ids.iter().map(String::as_str))
    }
}

/// Pagination state for a full namespace scan.
///
/// Backends with offsets or cursors advance `offset`; backends without them
/// tag every seen vector with `run_marker` and exclude tagged vectors on the
/// next fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    pub run_marker: String,
    pub offset: Option<String>,
    pub page_size: usize,
    pub dimensions: Option<usize>,
    pub pages: usize,
}

impl PageCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            run_marker: uuid::Uuid::new_v4().to_string(),
            offset: None,
            page_size,
            dimensions: None,
            pages: 0,
        }
    }
}

// ============================================================================
// Connector Trait
// ============================================================================

/// Capability surface every vector database adapter implements.
///
/// Namespace arguments are the identifiers produced by
/// [`VectorConnector::collection_name`].
#[async_trait]
pub trait VectorConnector: Send + Sync {
    fn kind(&self) -> ConnectorType;

    /// Remote identifier for a workspace slug; pure and deterministic
    fn collection_name(&self, slug: &str) -> String {
        slug.to_string()
    }

    /// Health check; unreachable backends are transient, bad settings fatal
    async fn connect(&self) -> Result<()>;

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    /// `None` when the namespace does not exist
    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>>;

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.namespace(name).await?.is_some())
    }

    /// Sum of vector counts across all namespaces
    async fn total_indices(&self) -> Result<u64> {
        Ok(self
            .namespaces()
            .await?
            .iter()
            .map(|ns| ns.vector_count)
            .sum())
    }

    async fn create_namespace(&self, name: &str, dimensions: usize) -> Result<()>;

    /// Drop a namespace and every vector in it
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Single remote upsert call; callers go through `add_vectors`
    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()>;

    /// Chunked bulk upsert collecting per-chunk failures.
    ///
    /// Connection errors abort the call; any other chunk failure is recorded
    /// and the remaining chunks still run.
    async fn add_vectors(
        &self,
        namespace: &str,
        records: &[VectorRecord],
    ) -> Result<AddVectorsOutcome> {
        let mut outcome = AddVectorsOutcome::default();

        for (index, chunk) in records.chunks(UPSERT_CHUNK_SIZE).enumerate() {
            if index > 0 {
                if let Some(delay) = self.write_delay() {
                    tracing::debug!(namespace, ?delay, "Waiting between upsert chunks");
                    tokio::time::sleep(delay).await;
                }
            }

            match self.upsert_batch(namespace, chunk).await {
                Ok(()) => outcome.inserted += chunk.len(),
                Err(e @ VdmError::ConnectionError { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(namespace, chunk = index, error = %e, "Upsert chunk failed");
                    outcome.errors.push(BatchFailure {
                        chunk: index,
                        ids: chunk.iter().map(|r| r.id.clone()).collect(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()>;

    /// Replace values and metadata of an existing vector, keeping its id
    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()>;

    /// Replace the metadata of an existing vector wholesale, keeping its
    /// values. Keys absent from `metadata` must not survive.
    async fn replace_metadata(
        &self,
        namespace: &str,
        existing: &VectorRecord,
        metadata: &Metadata,
    ) -> Result<()> {
        let record = VectorRecord::new(
            existing.id.clone(),
            existing.values.clone(),
            metadata.clone(),
        );
        self.update_vector(namespace, &record).await
    }

    /// `None` when the vector does not exist
    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>>;

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse>;

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>>;

    /// Dimensionality sampled from one stored vector, 0 when empty
    async fn index_dimensions(&self, namespace: &str) -> Result<usize>;

    /// Next page of a full scan; an empty page ends the scan
    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>>;

    /// Tag a fetched page so the next fetch skips it
    async fn mark_seen(&self, _namespace: &str, _ids: &[String], _cursor: &PageCursor) -> Result<()> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        OFFSET_PAGE_SIZE
    }

    /// Whether this deployment can hold the given namespace
    fn supports_namespace(&self, _name: &str) -> bool {
        true
    }

    /// Whether the unnamed default namespace always exists remotely
    fn has_default_namespace(&self) -> bool {
        false
    }

    /// Whether whole namespaces can be dropped in one call
    fn can_drop_namespaces(&self) -> bool {
        true
    }

    /// Whether stored metadata can be replaced without re-embedding
    fn supports_metadata_updates(&self) -> bool {
        true
    }

    /// Pause required after writes before data is consistent
    fn write_delay(&self) -> Option<Duration> {
        None
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the adapter matching the connector's stored type
pub fn select_connector(
    config: &ConnectorConfig,
    jobs: &JobsConfig,
) -> Result<Box<dyn VectorConnector>> {
    let connector: Box<dyn VectorConnector> = match config.kind {
        ConnectorType::Chroma => Box::new(ChromaConnector::new(config.typed_settings()?)?),
        ConnectorType::Pinecone => Box::new(
            PineconeConnector::new(config.typed_settings()?)?
                .with_starter_delay(jobs.starter_tier_delay()),
        ),
        ConnectorType::Qdrant => Box::new(QdrantConnector::new(config.typed_settings()?)?),
        ConnectorType::Weaviate => Box::new(WeaviateConnector::new(config.typed_settings()?)?),
    };

    tracing::debug!(connector = %config.kind, organization = config.organization_id, "Connector selected");
    Ok(connector)
}

/// Flatten nested metadata into `_`-joined keys
pub fn flatten_metadata(metadata: &Metadata) -> Metadata {
    fn walk(prefix: &str, value: &serde_json::Value, out: &mut Metadata) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, nested) in map {
                    let key = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}_{key}")
                    };
                    walk(&key, nested, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }

    let mut out = Metadata::new();
    for (key, value) in metadata {
        walk(key, value, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_connector_by_type() {
        let config = ConnectorConfig::new(
            1,
            ConnectorType::Chroma,
            json!({ "instanceURL": "http://localhost:8000" }),
        );
        let connector = select_connector(&config, &JobsConfig::default()).unwrap();
        assert_eq!(connector.kind(), ConnectorType::Chroma);

        let config = ConnectorConfig::new(
            1,
            ConnectorType::Weaviate,
            json!({ "clusterUrl": "http://localhost:8080" }),
        );
        let connector = select_connector(&config, &JobsConfig::default()).unwrap();
        assert_eq!(connector.collection_name("my-docs"), "MyDocs");
    }

    #[test]
    fn test_select_connector_rejects_bad_settings() {
        let config = ConnectorConfig::new(1, ConnectorType::Pinecone, json!({ "index": "x" }));
        let err = select_connector(&config, &JobsConfig::default()).err().unwrap();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_flatten_metadata() {
        let metadata = json!({
            "title": "a.txt",
            "loc": { "lines": { "from": 1, "to": 4 } },
            "tags": ["x"]
        });
        let flat = flatten_metadata(metadata.as_object().unwrap());
        assert_eq!(flat["title"], "a.txt");
        assert_eq!(flat["loc_lines_from"], 1);
        assert_eq!(flat["loc_lines_to"], 4);
        assert_eq!(flat["tags"], json!(["x"]));
    }

    #[test]
    fn test_outcome_failed_ids() {
        let outcome = AddVectorsOutcome {
            inserted: 500,
            errors: vec![BatchFailure {
                chunk: 1,
                ids: vec!["a".into(), "b".into()],
                error: "boom".into(),
            }],
        };
        assert!(!outcome.success());
        assert_eq!(outcome.failed_ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_cursor_markers_are_unique() {
        assert_ne!(PageCursor::new(10).run_marker, PageCursor::new(10).run_marker);
    }
}
