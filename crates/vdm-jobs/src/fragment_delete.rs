//! Fragment delete job
//!
//! Removes one vector from its remote namespace, its fragment row and its
//! entry in the document's cache file.

use serde_json::json;
use vdm_core::{JobReport, Result, VdmError};
use vdm_vector::VectorCacheStore;

use crate::{DeleteFragmentPayload, JobContext};

pub struct FragmentDeleteJob {
    ctx: JobContext,
}

impl FragmentDeleteJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Returns the removed vector id
    pub async fn run(&self, payload: &DeleteFragmentPayload) -> Result<String> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.delete(payload).await;
        reporter
            .finish(outcome, |vector_id| {
                JobReport::message(format!("Vector {vector_id} deleted."))
                    .with_details(json!({ "vectorId": vector_id }))
            })
            .await
    }

    async fn delete(&self, payload: &DeleteFragmentPayload) -> Result<String> {
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
        let namespace = connector.collection_name(&workspace.slug);

        connector
            .delete_ids(&namespace, std::slice::from_ref(&fragment.vector_id))
            .await?;
        self.ctx.ledger.delete_document_vector(fragment.id).await?;

        let removed = self
            .ctx
            .cache
            .remove_entry(&VectorCacheStore::key_for(&document), &fragment.vector_id)
            .await?;
        if !removed {
            tracing::debug!(vector_id = %fragment.vector_id, "Vector was not cached");
        }

        tracing::info!(vector_id = %fragment.vector_id, namespace = %namespace, "Fragment deleted");
        Ok(fragment.vector_id)
    }
}
