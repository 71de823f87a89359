//! Document delete job
//!
//! Deleting a document removes its vectors from the remote namespace, its
//! rows (fragments cascade) and its cache file.

use serde_json::json;
use vdm_core::{JobReport, Result, VdmError};
use vdm_vector::VectorCacheStore;

use crate::{DeleteDocumentPayload, JobContext};

pub struct DocumentDeleteJob {
    ctx: JobContext,
}

impl DocumentDeleteJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Returns the number of vectors removed
    pub async fn run(&self, payload: &DeleteDocumentPayload) -> Result<usize> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.delete(payload.document_id).await;
        reporter
            .finish(outcome, |count| {
                JobReport::message(format!("Document {} deleted.", payload.document_id))
                    .with_details(json!({ "vectorsRemoved": count }))
            })
            .await
    }

    async fn delete(&self, document_id: i64) -> Result<usize> {
        let document = self
            .ctx
            .ledger
            .document(document_id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("document {document_id}")))?;
        let workspace = self.ctx.workspace(document.workspace_id).await?;
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;
        let namespace = connector.collection_name(&workspace.slug);

        let vector_ids: Vec<String> = self
            .ctx
            .ledger
            .vectors_for_document(document.id)
            .await?
            .into_iter()
            .map(|v| v.vector_id)
            .collect();

        if !vector_ids.is_empty() {
            connector.delete_ids(&namespace, &vector_ids).await?;
        }
        self.ctx.ledger.delete_document(document.id).await?;
        self.ctx
            .cache
            .delete(&VectorCacheStore::key_for(&document))
            .await?;

        tracing::info!(
            document = %document.name,
            vectors = vector_ids.len(),
            namespace = %namespace,
            "Document deleted"
        );
        Ok(vector_ids.len())
    }
}
