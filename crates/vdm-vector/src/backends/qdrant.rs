//! Qdrant connector
//!
//! Collections map 1:1 to workspaces. Scans use Qdrant's native scroll
//! offsets; updates are plain upserts under the same point id.
//!
//! Author: hephaex@gmail.com

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors_config, vectors_output::VectorsOptions,
    CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, GetPointsBuilder,
    PointId, PointStruct, PointsIdsList, RetrievedPoint, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder, VectorsOutput,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vdm_core::{ConnectorType, Result, VdmError};

use crate::{
    Metadata, NamespaceInfo, PageCursor, SimilarityResponse, VectorConnector, VectorMetadata,
    VectorRecord,
};

/// Connector settings as stored for a Qdrant organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QdrantSettings {
    pub cluster_url: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

/// Qdrant vector store connector
pub struct QdrantConnector {
    client: Qdrant,
}

impl QdrantConnector {
    /// Create a new Qdrant connection
    pub fn new(settings: QdrantSettings) -> Result<Self> {
        let mut builder = Qdrant::from_url(&settings.cluster_url);
        if let Some(key) = settings.api_key.filter(|k| !k.is_empty()) {
            builder = builder.api_key(key);
        }

        let client = builder
            .build()
            .map_err(|e| VdmError::misconfigured(format!("Qdrant connection failed: {e}")))?;

        Ok(Self { client })
    }

    async fn points_count(&self, collection: &str) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(collection).exact(true))
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to count points: {e}")))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<RetrievedPoint>> {
        let ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, ids)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to get points: {e}")))?;
        Ok(response.result)
    }

    fn to_point(record: &VectorRecord) -> PointStruct {
        let payload: HashMap<String, QdrantValue> = record
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        // qdrant-client speaks single precision
        let values: Vec<f32> = record.values.iter().map(|v| *v as f32).collect();
        PointStruct::new(point_id(&record.id), values, payload)
    }
}

/// Numeric ids stay numeric; everything else is sent as a UUID string
fn point_id(id: &str) -> PointId {
    match id.parse::<u64>() {
        Ok(num) => num.into(),
        Err(_) => id.to_string().into(),
    }
}

fn point_id_string(id: Option<PointId>) -> String {
    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Num(num)) => num.to_string(),
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        None => String::new(),
    }
}

fn value_to_json(value: QdrantValue) -> Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(fields)) => Value::Object(
            fields
                .fields
                .into_iter()
                .map(|(k, v)| (k, value_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_metadata(payload: HashMap<String, QdrantValue>) -> Metadata {
    payload
        .into_iter()
        .map(|(k, v)| (k, value_to_json(v)))
        .collect()
}

#[allow(deprecated)]
fn dense_vector(vectors: Option<VectorsOutput>) -> Vec<f64> {
    let data = match vectors.and_then(|v| v.vectors_options) {
        Some(VectorsOptions::Vector(output)) => output.data,
        Some(VectorsOptions::Vectors(named)) => named
            .vectors
            .into_values()
            .next()
            .map(|output| output.data)
            .unwrap_or_default(),
        None => Vec::new(),
    };
    data.into_iter().map(f64::from).collect()
}

fn to_record(point: RetrievedPoint) -> VectorRecord {
    VectorRecord::new(
        point_id_string(point.id),
        dense_vector(point.vectors),
        payload_to_metadata(point.payload),
    )
}

#[async_trait]
impl VectorConnector for QdrantConnector {
    fn kind(&self) -> ConnectorType {
        ConnectorType::Qdrant
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map_err(|e| VdmError::unreachable(format!("Qdrant health check failed: {e}")))?;
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let collections =
            self.client.list_collections().await.map_err(|e| {
                VdmError::unreachable(format!("Failed to list collections: {e}"))
            })?;

        let mut namespaces = Vec::with_capacity(collections.collections.len());
        for collection in collections.collections {
            let vector_count = self.points_count(&collection.name).await?;
            namespaces.push(NamespaceInfo {
                name: collection.name,
                vector_count,
            });
        }
        Ok(namespaces)
    }

    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| VdmError::unreachable(format!("Failed to check collection: {e}")))?;
        if !exists {
            return Ok(None);
        }

        Ok(Some(NamespaceInfo {
            name: name.to_string(),
            vector_count: self.points_count(name).await?,
        }))
    }

    async fn create_namespace(&self, name: &str, dimensions: usize) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimensions as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to create collection: {e}")))?;

        tracing::info!(collection = name, dimensions, "Qdrant collection created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to delete collection: {e}")))?;

        tracing::info!(collection = name, "Qdrant collection deleted");
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let points: Vec<PointStruct> = records.iter().map(Self::to_point).collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(namespace, points).wait(true))
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to upsert vectors: {e}")))?;
        Ok(())
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(namespace)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to delete vectors: {e}")))?;
        Ok(())
    }

    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()> {
        self.upsert_batch(namespace, std::slice::from_ref(record))
            .await
    }

    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>> {
        let points = self.retrieve(namespace, &[id.to_string()]).await?;
        Ok(points.into_iter().next().map(to_record))
    }

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse> {
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(namespace, query.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Vector search failed: {e}")))?;

        let mut response = SimilarityResponse::default();
        for point in results.result {
            let metadata = payload_to_metadata(point.payload);
            let text = metadata
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            response.push(point_id_string(point.id), text, metadata, point.score);
        }
        Ok(response)
    }

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>> {
        Ok(self
            .retrieve(namespace, ids)
            .await?
            .into_iter()
            .map(to_record)
            .map(|r| VectorMetadata {
                vector_id: r.id,
                metadata: r.metadata,
            })
            .collect())
    }

    async fn index_dimensions(&self, namespace: &str) -> Result<usize> {
        let info = self
            .client
            .collection_info(namespace)
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to get collection: {e}")))?;

        let configured = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|c| match c {
                vectors_config::Config::Params(params) => Some(params.size as usize),
                vectors_config::Config::ParamsMap(map) => {
                    map.map.into_values().next().map(|p| p.size as usize)
                }
            });
        if let Some(size) = configured {
            return Ok(size);
        }

        let mut cursor = PageCursor::new(1);
        let sample = self.fetch_next_page(namespace, &mut cursor).await?;
        Ok(sample.first().map(|r| r.values.len()).unwrap_or(0))
    }

    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>> {
        if cursor.pages > 0 && cursor.offset.is_none() {
            return Ok(Vec::new());
        }

        let mut request = ScrollPointsBuilder::new(namespace)
            .limit(cursor.page_size as u32)
            .with_payload(true)
            .with_vectors(true);
        if let Some(offset) = cursor.offset.as_deref() {
            request = request.offset(point_id(offset));
        }

        let response = self
            .client
            .scroll(request)
            .await
            .map_err(|e| VdmError::VectorDbError(format!("Failed to scroll points: {e}")))?;

        cursor.pages += 1;
        cursor.offset = response
            .next_page_offset
            .map(|id| point_id_string(Some(id)))
            .filter(|id| !id.is_empty());

        Ok(response.result.into_iter().map(to_record).collect())
    }
}
