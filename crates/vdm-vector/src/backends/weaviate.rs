//! Weaviate connector over the REST and GraphQL APIs
//!
//! Class names are PascalCase derivations of the workspace slug. Weaviate
//! cannot change a stored vector in place, so updates delete and recreate
//! the object under the same id.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vdm_core::{ConnectorType, Result, VdmError};

use super::{base_url, check_status, http_client, json_body, transport_error};
use crate::{
    Metadata, NamespaceInfo, PageCursor, SimilarityResponse, VectorConnector, VectorMetadata,
    VectorRecord, DELETE_CHUNK_SIZE,
};

const BACKEND: &str = "Weaviate";

/// Connector settings as stored for a Weaviate organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaviateSettings {
    pub cluster_url: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

/// PascalCase class name for a slug: `my-docs_v2` becomes `MyDocsV2`
pub fn class_name(slug: &str) -> String {
    let name: String = slug
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    match name.chars().next() {
        None => "Default".to_string(),
        Some(c) if c.is_ascii_digit() => format!("C{name}"),
        Some(_) => name,
    }
}

/// Weaviate property names allow only `[_A-Za-z][_0-9A-Za-z]*`
fn property_name(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    match name.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("_{name}"),
        _ => name,
    }
}

/// Flattened, sanitized properties; nulls are dropped
pub fn to_properties(metadata: &Metadata) -> Metadata {
    crate::flatten_metadata(metadata)
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (property_name(&k), v))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct Schema {
    #[serde(default)]
    classes: Vec<ClassSchema>,
}

#[derive(Debug, Deserialize)]
struct ClassSchema {
    class: String,
    #[serde(default)]
    properties: Vec<PropertySchema>,
}

#[derive(Debug, Deserialize)]
struct PropertySchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    id: String,
    #[serde(default)]
    properties: Metadata,
    #[serde(default)]
    vector: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<Value>>,
}

/// Split a GraphQL `Get` object into its record and `_additional` block
fn split_object(mut object: Metadata) -> (VectorRecord, Value) {
    let additional = object.remove("_additional").unwrap_or(Value::Null);
    let id = additional["id"].as_str().unwrap_or_default().to_string();
    let values = additional["vector"]
        .as_array()
        .map(|v| v.iter().filter_map(|x| x.as_f64()).collect())
        .unwrap_or_default();
    object.retain(|_, v| !v.is_null());
    (VectorRecord::new(id, values, object), additional)
}

/// Weaviate connector
pub struct WeaviateConnector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl WeaviateConnector {
    pub fn new(settings: WeaviateSettings) -> Result<Self> {
        if settings.cluster_url.trim().is_empty() {
            return Err(VdmError::misconfigured("Weaviate clusterUrl is required"));
        }

        Ok(Self {
            client: http_client()?,
            base_url: base_url(&settings.cluster_url),
            api_key: settings.api_key.filter(|k| !k.is_empty()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/v1{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))
    }

    async fn schema(&self) -> Result<Schema> {
        let response = self.send(self.request(reqwest::Method::GET, "/schema")).await?;
        json_body(BACKEND, response).await
    }

    async fn class(&self, class: &str) -> Result<Option<ClassSchema>> {
        Ok(self
            .schema()
            .await?
            .classes
            .into_iter()
            .find(|c| c.class == class))
    }

    async fn graphql(&self, query: String) -> Result<Value> {
        let response = self
            .send(self.request(reqwest::Method::POST, "/graphql").json(&json!({ "query": query })))
            .await?;
        let body: GraphQlResponse = json_body(BACKEND, response).await?;

        match (body.data, body.errors) {
            (Some(data), _) if !data.is_null() => Ok(data),
            (_, errors) => Err(VdmError::VectorDbError(format!(
                "Weaviate: GraphQL query failed: {}",
                Value::from(errors.unwrap_or_default())
            ))),
        }
    }

    async fn count(&self, class: &str) -> Result<u64> {
        let data = self
            .graphql(format!("{{ Aggregate {{ {class} {{ meta {{ count }} }} }} }}"))
            .await?;
        Ok(data["Aggregate"][class][0]["meta"]["count"]
            .as_u64()
            .unwrap_or(0))
    }

    /// Property field list for GraphQL selections
    async fn field_names(&self, class: &str) -> Result<String> {
        Ok(self
            .class(class)
            .await?
            .map(|c| {
                c.properties
                    .into_iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default())
    }

    async fn get_objects(
        &self,
        class: &str,
        arguments: String,
        additional: &str,
    ) -> Result<Vec<(VectorRecord, Value)>> {
        let fields = self.field_names(class).await?;
        let data = self
            .graphql(format!(
                "{{ Get {{ {class}({arguments}) {{ {fields} _additional {{ {additional} }} }} }} }}"
            ))
            .await?;

        Ok(data["Get"][class]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|object| match object {
                Value::Object(map) => Some(split_object(map)),
                _ => None,
            })
            .collect())
    }

    async fn get_object(&self, class: &str, id: &str) -> Result<Option<StoredObject>> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, &format!("/objects/{class}/{id}"))
                    .query(&[("include", "vector")]),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json_body(BACKEND, response).await.map(Some)
    }

    async fn delete_object(&self, class: &str, id: &str) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::DELETE, &format!("/objects/{class}/{id}")))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(BACKEND, response).await?;
        Ok(())
    }

    fn object_body(class: &str, record: &VectorRecord) -> Value {
        json!({
            "class": class,
            "id": record.id,
            "vector": record.values,
            "properties": to_properties(&record.metadata),
        })
    }
}

#[async_trait]
impl VectorConnector for WeaviateConnector {
    fn kind(&self) -> ConnectorType {
        ConnectorType::Weaviate
    }

    fn collection_name(&self, slug: &str) -> String {
        class_name(slug)
    }

    fn supports_metadata_updates(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/.well-known/live"))
            .await?;
        if !response.status().is_success() {
            return Err(VdmError::unreachable(format!(
                "Weaviate: cluster not ready ({})",
                response.status()
            )));
        }
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let mut namespaces = Vec::new();
        for class in self.schema().await?.classes {
            let vector_count = self.count(&class.class).await?;
            namespaces.push(NamespaceInfo {
                name: class.class,
                vector_count,
            });
        }
        Ok(namespaces)
    }

    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        let class = class_name(name);
        if self.class(&class).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(NamespaceInfo {
            vector_count: self.count(&class).await?,
            name: class,
        }))
    }

    async fn create_namespace(&self, name: &str, _dimensions: usize) -> Result<()> {
        let class = class_name(name);
        let response = self
            .send(
                self.request(reqwest::Method::POST, "/schema")
                    .json(&json!({ "class": class, "vectorizer": "none" })),
            )
            .await?;
        check_status(BACKEND, response).await?;
        tracing::info!(class = %class, "Weaviate class created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let class = class_name(name);
        let response = self
            .send(self.request(reqwest::Method::DELETE, &format!("/schema/{class}")))
            .await?;
        check_status(BACKEND, response).await?;
        tracing::info!(class = %class, "Weaviate class deleted");
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let class = class_name(namespace);
        let objects: Vec<Value> = records
            .iter()
            .map(|r| Self::object_body(&class, r))
            .collect();

        let response = self
            .send(
                self.request(reqwest::Method::POST, "/batch/objects")
                    .json(&json!({ "objects": objects })),
            )
            .await?;
        let results: Vec<Value> = json_body(BACKEND, response).await?;

        let failed: Vec<String> = results
            .iter()
            .filter(|r| r["result"]["errors"].is_object())
            .map(|r| r["id"].as_str().unwrap_or_default().to_string())
            .collect();
        if !failed.is_empty() {
            return Err(VdmError::VectorDbError(format!(
                "Weaviate: {} objects rejected: {}",
                failed.len(),
                failed.join(", ")
            )));
        }
        Ok(())
    }

    /// No bulk delete by id: bounded groups of concurrent single deletes
    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        let class = class_name(namespace);
        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let results = join_all(chunk.iter().map(|id| self.delete_object(&class, id))).await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()> {
        let class = class_name(namespace);
        self.delete_object(&class, &record.id).await?;

        let response = self
            .send(
                self.request(reqwest::Method::POST, "/objects")
                    .json(&Self::object_body(&class, record)),
            )
            .await?;
        check_status(BACKEND, response).await?;

        tracing::debug!(class = %class, vector_id = %record.id, "Weaviate object recreated");
        Ok(())
    }

    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>> {
        let class = class_name(namespace);
        Ok(self
            .get_object(&class, id)
            .await?
            .map(|o| VectorRecord::new(o.id, o.vector, o.properties)))
    }

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse> {
        let class = class_name(namespace);
        let vector = serde_json::to_string(query)
            .map_err(|e| VdmError::ValidationError(format!("Invalid query vector: {e}")))?;
        let records = self
            .get_objects(
                &class,
                format!("nearVector: {{ vector: {vector} }}, limit: {top_k}"),
                "id certainty",
            )
            .await?;

        let mut response = SimilarityResponse::default();
        for (record, additional) in records {
            let certainty = additional["certainty"].as_f64().unwrap_or(0.0) as f32;
            let text = record.text().unwrap_or_default().to_string();
            response.push(record.id, text, record.metadata, certainty);
        }
        Ok(response)
    }

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>> {
        let class = class_name(namespace);
        let mut metadata = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(object) = self.get_object(&class, id).await? {
                metadata.push(VectorMetadata {
                    vector_id: object.id,
                    metadata: object.properties,
                });
            }
        }
        Ok(metadata)
    }

    async fn index_dimensions(&self, namespace: &str) -> Result<usize> {
        let class = class_name(namespace);
        let records = self
            .get_objects(&class, "limit: 1".to_string(), "id vector")
            .await?;
        Ok(records.first().map(|(r, _)| r.values.len()).unwrap_or(0))
    }

    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>> {
        let class = class_name(namespace);
        let arguments = match cursor.offset.as_deref() {
            Some(after) => format!("limit: {}, after: \"{after}\"", cursor.page_size),
            None => format!("limit: {}", cursor.page_size),
        };

        let records: Vec<VectorRecord> = self
            .get_objects(&class, arguments, "id vector")
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .collect();
        cursor.pages += 1;
        if let Some(last) = records.last() {
            cursor.offset = Some(last.id.clone());
        }
        Ok(records)
    }
}
