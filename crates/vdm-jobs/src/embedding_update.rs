//! Embedding update engine
//!
//! Re-embeds one fragment with new text and writes the result to the remote
//! vector and to its entry in the document's cache file. Nothing is mutated
//! until the text has been validated and embedded.

use std::sync::Arc;

use serde_json::{json, Value};
use vdm_core::{
    validate_embedding_text, Document, DocumentVector, JobReport, Result, VdmError, Workspace,
};
use vdm_vector::{EmbeddingClient, Metadata, VectorCacheStore, VectorRecord};

use crate::{JobContext, UpdateEmbeddingPayload};

/// Result of a successful update
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingUpdate {
    pub document_id: i64,
    pub vector_id: String,
    pub old_text: Option<String>,
    pub new_text: String,
    pub metadata: Metadata,
}

/// Single-fragment repair across remote, cache and ledger
pub struct EmbeddingUpdateEngine {
    ctx: JobContext,
    embedder: Arc<dyn EmbeddingClient>,
}

impl EmbeddingUpdateEngine {
    pub fn new(ctx: JobContext, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { ctx, embedder }
    }

    pub async fn run(&self, payload: &UpdateEmbeddingPayload) -> Result<EmbeddingUpdate> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.update(payload).await;
        reporter
            .finish(outcome, |update| {
                JobReport::message(format!(
                    "Document {} with vector {} updated with newly embedded text.",
                    update.document_id, update.vector_id
                ))
                .with_details(json!({
                    "oldText": update.old_text,
                    "newText": update.new_text,
                }))
            })
            .await
    }

    async fn load(
        &self,
        document_vector_id: i64,
    ) -> Result<(DocumentVector, Document, Workspace)> {
        let fragment = self
            .ctx
            .ledger
            .document_vector(document_vector_id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("document vector {document_vector_id}")))?;
        let document = self
            .ctx
            .ledger
            .document(fragment.document_id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("document {}", fragment.document_id)))?;
        let workspace = self.ctx.workspace(document.workspace_id).await?;
        Ok((fragment, document, workspace))
    }

    async fn update(&self, payload: &UpdateEmbeddingPayload) -> Result<EmbeddingUpdate> {
        let (fragment, document, workspace) = self.load(payload.document_vector_id).await?;
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;
        let namespace = connector.collection_name(&workspace.slug);

        // 1. The namespace and the vector must both exist remotely
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

        // 2. Token budget
        let estimate = validate_embedding_text(&payload.new_text)?;

        // 3. Embed
        tracing::info!(
            vector_id = %fragment.vector_id,
            tokens = estimate.length,
            "Embedding text"
        );
        let embedding = self.embedder.embed(&payload.new_text).await?;
        if embedding.is_empty() {
            return Err(VdmError::EmbeddingError(
                "Failed to embed text chunk".to_string(),
            ));
        }

        // 4. Remote write
        let old_text = existing.text().map(str::to_string);
        let metadata = merged_metadata(existing.metadata, &payload.new_text, estimate.length);
        let values = embedding.into_iter().map(f64::from).collect();
        let record = VectorRecord::new(fragment.vector_id.clone(), values, metadata);
        connector.update_vector(&namespace, &record).await?;

        // 5. Cache entry
        let key = VectorCacheStore::key_for(&document);
        match self
            .ctx
            .cache
            .update_entry(&key, &record.id, record.values.clone(), record.metadata.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(vector_id = %record.id, cache = %key, "Vector missing from cache file");
            }
            Err(VdmError::CacheMissing(path)) => {
                tracing::warn!(cache = %path, "No vector cache for document, remote updated only");
            }
            Err(e) => return Err(e),
        }

        Ok(EmbeddingUpdate {
            document_id: document.id,
            vector_id: record.id,
            old_text,
            new_text: payload.new_text.clone(),
            metadata: record.metadata,
        })
    }
}

/// Existing metadata with the new text and its counts layered on top
pub(crate) fn merged_metadata(mut metadata: Metadata, text: &str, tokens: usize) -> Metadata {
    metadata.insert("wordCount".into(), json!(text.split(' ').count()));
    metadata.insert("token_count_estimate".into(), json!(tokens));
    metadata.insert("text".into(), Value::String(text.to_string()));
    metadata
}
