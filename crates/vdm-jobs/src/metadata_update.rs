//! Metadata update job
//!
//! Replaces the metadata of one fragment without re-embedding it. The new
//! metadata is complete: keys it does not name are dropped, except `text`,
//! which always survives so the fragment stays searchable and syncable.

use serde_json::{json, Value};
use vdm_core::{JobReport, Result, VdmError};
use vdm_vector::{Metadata, VectorCacheStore};

use crate::{JobContext, UpdateMetadataPayload};

/// Result of a metadata update
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataUpdate {
    Applied {
        document_id: i64,
        vector_id: String,
        old_metadata: Metadata,
        updated_metadata: Metadata,
    },
    /// The backend cannot replace metadata in place
    Unsupported { backend: &'static str },
}

pub struct MetadataUpdateJob {
    ctx: JobContext,
}

impl MetadataUpdateJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, payload: &UpdateMetadataPayload) -> Result<MetadataUpdate> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.update(payload).await;
        reporter
            .finish(outcome, |update| match update {
                MetadataUpdate::Applied {
                    document_id,
                    vector_id,
                    old_metadata,
                    updated_metadata,
                } => JobReport::message(format!(
                    "Document {document_id} with vector {vector_id} updated with new metadata."
                ))
                .with_details(json!({
                    "oldMetadata": old_metadata,
                    "updatedMetadata": updated_metadata,
                })),
                MetadataUpdate::Unsupported { backend } => JobReport::message(format!(
                    "Metadata updates are not enabled for {backend} database connections - nothing was done."
                )),
            })
            .await
    }

    async fn update(&self, payload: &UpdateMetadataPayload) -> Result<MetadataUpdate> {
        let fragment = self
            .ctx
            .ledger
            .document_vector(payload.document_vector_id)
            .await?
            .ok_or_else(|| {
                VdmError::NotFound(format!("document vector {}", payload.document_vector_id))
            })?;
        let document = self
            .ctx
            .ledger
            .document(fragment.document_id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("document {}", fragment.document_id)))?;
        let workspace = self.ctx.workspace(document.workspace_id).await?;
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;

        if !connector.supports_metadata_updates() {
            tracing::info!(backend = %connector.kind(), "Metadata updates not supported");
            return Ok(MetadataUpdate::Unsupported {
                backend: connector.kind().label(),
            });
        }

        let namespace = connector.collection_name(&workspace.slug);
        if !connector.namespace_exists(&namespace).await? {
            return Err(VdmError::NotFound(format!(
                "No namespace found with name {}",
                workspace.slug
            )));
        }
        let existing = connector
            .fetch_vector(&namespace, &fragment.vector_id)
            .await?
            .ok_or_else(|| {
                VdmError::NotFound(format!("No vector found with ID {}", fragment.vector_id))
            })?;

        let updated = replacement_metadata(&existing.metadata, &payload.new_metadata);
        connector
            .replace_metadata(&namespace, &existing, &updated)
            .await?;

        let key = VectorCacheStore::key_for(&document);
        match self
            .ctx
            .cache
            .update_entry(&key, &existing.id, existing.values.clone(), updated.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(vector_id = %existing.id, cache = %key, "Vector missing from cache file");
            }
            Err(VdmError::CacheMissing(path)) => {
                tracing::warn!(cache = %path, "No vector cache for document, remote updated only");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(vector_id = %existing.id, namespace = %namespace, "Metadata replaced");
        Ok(MetadataUpdate::Applied {
            document_id: document.id,
            vector_id: existing.id,
            old_metadata: existing.metadata,
            updated_metadata: updated,
        })
    }
}

/// The new metadata, carrying over the stored `text`
pub(crate) fn replacement_metadata(existing: &Metadata, new_metadata: &Metadata) -> Metadata {
    let mut updated = new_metadata.clone();
    if let Some(text) = existing.get("text").and_then(Value::as_str) {
        updated.insert("text".into(), Value::String(text.to_string()));
    }
    updated
}
