//! Workspace and document cloning
//!
//! A clone stays inside one organization's vector database. Values and
//! metadata come from the vector cache; the copy gets fresh docIds and
//! vector ids, so it can be edited or deleted independently.

use serde::Serialize;
use serde_json::json;
use vdm_core::{Document, JobReport, Result, VdmError, Workspace};
use vdm_vector::{CacheEntry, VectorCacheStore, VectorConnector};

use crate::migration::copy_document;
use crate::{aborts_job, create_workspace, CloneDocumentPayload, CloneWorkspacePayload, JobContext};

/// Namespace dimensions when none of the source documents is cached
const DEFAULT_DIMENSIONS: usize = 1536;

/// Outcome of a workspace clone
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceClone {
    pub workspace: Workspace,
    pub cloned_documents: usize,
    pub cloned_vectors: usize,
    pub skipped_documents: Vec<String>,
}

pub struct WorkspaceCloneJob {
    ctx: JobContext,
}

impl WorkspaceCloneJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, payload: &CloneWorkspacePayload) -> Result<WorkspaceClone> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.clone_workspace(payload).await;
        reporter
            .finish(outcome, |(source, clone)| {
                JobReport::message(format!(
                    "Workspace {} embeddings cloned into {} successfully.",
                    source.name, clone.workspace.name
                ))
                .with_details(json!(clone))
            })
            .await
            .map(|(_, clone)| clone)
    }

    async fn clone_workspace(
        &self,
        payload: &CloneWorkspacePayload,
    ) -> Result<(Workspace, WorkspaceClone)> {
        let source = self.ctx.workspace(payload.workspace_id).await?;
        let organization = self.ctx.organization(source.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;

        let documents = self.ctx.ledger.documents_for_workspace(source.id).await?;
        let mut cached = Vec::with_capacity(documents.len());
        let mut skipped = Vec::new();
        for document in documents {
            match read_cache(&self.ctx, &document).await {
                Ok(entries) => cached.push((document, entries)),
                Err(e) if aborts_job(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(document = %document.name, error = %e, "Not cloning uncached document");
                    skipped.push(document.name);
                }
            }
        }

        let dimensions = cached
            .iter()
            .flat_map(|(_, entries)| entries.first())
            .map(|entry| entry.values.len())
            .next()
            .unwrap_or(DEFAULT_DIMENSIONS);
        let cloned = create_workspace(
            &self.ctx,
            organization.id,
            &payload.new_workspace_name,
            dimensions,
        )
        .await?;

        let mut clone = WorkspaceClone {
            workspace: cloned,
            cloned_documents: 0,
            cloned_vectors: 0,
            skipped_documents: skipped,
        };
        if let Err(e) = self
            .copy_documents(connector.as_ref(), cached, &mut clone)
            .await
        {
            self.discard(connector.as_ref(), &clone.workspace).await;
            return Err(e);
        }

        tracing::info!(
            source = %source.slug,
            clone = %clone.workspace.slug,
            documents = clone.cloned_documents,
            vectors = clone.cloned_vectors,
            "Workspace cloned"
        );
        Ok((source, clone))
    }

    async fn copy_documents(
        &self,
        connector: &dyn VectorConnector,
        cached: Vec<(Document, Vec<CacheEntry>)>,
        clone: &mut WorkspaceClone,
    ) -> Result<()> {
        let namespace = connector.collection_name(&clone.workspace.slug);
        for (document, entries) in cached {
            match copy_document(
                &self.ctx,
                connector,
                &namespace,
                &clone.workspace,
                &document.name,
                entries,
            )
            .await
            {
                Ok((_, vectors)) => {
                    clone.cloned_documents += 1;
                    clone.cloned_vectors += vectors;
                }
                Err(e) if aborts_job(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(document = %document.name, error = %e, "Document clone failed");
                    clone.skipped_documents.push(document.name);
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal of a half-built clone
    async fn discard(&self, connector: &dyn VectorConnector, workspace: &Workspace) {
        for document in self
            .ctx
            .ledger
            .documents_for_workspace(workspace.id)
            .await
            .unwrap_or_default()
        {
            if let Err(e) = self
                .ctx
                .cache
                .delete(&VectorCacheStore::key_for(&document))
                .await
            {
                tracing::warn!(document = %document.name, error = %e, "Failed to remove cloned cache");
            }
        }
        if let Err(e) = self.ctx.ledger.delete_workspace(workspace.id).await {
            tracing::warn!(workspace = %workspace.slug, error = %e, "Failed to remove cloned workspace");
        }
        if connector.can_drop_namespaces() {
            let namespace = connector.collection_name(&workspace.slug);
            if let Err(e) = connector.delete_namespace(&namespace).await {
                tracing::warn!(namespace = %namespace, error = %e, "Failed to remove cloned namespace");
            }
        }
    }
}

/// Outcome of a document clone
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentClone {
    pub document: Document,
    pub destination: Workspace,
    pub vectors: usize,
}

pub struct DocumentCloneJob {
    ctx: JobContext,
}

impl DocumentCloneJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, payload: &CloneDocumentPayload) -> Result<DocumentClone> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.clone_document(payload).await;
        reporter
            .finish(outcome, |clone| {
                JobReport::message(format!(
                    "Document {} cloned to {} completed.",
                    clone.document.name, clone.destination.name
                ))
                .with_details(json!({
                    "documentId": clone.document.id,
                    "docId": clone.document.doc_id,
                    "vectors": clone.vectors,
                }))
            })
            .await
    }

    async fn clone_document(&self, payload: &CloneDocumentPayload) -> Result<DocumentClone> {
        let document = self
            .ctx
            .ledger
            .document(payload.document_id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("document {}", payload.document_id)))?;
        let destination = self.ctx.workspace(payload.destination_workspace_id).await?;
        let organization = self.ctx.organization(destination.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;

        let entries = read_cache(&self.ctx, &document).await.map_err(|e| match e {
            VdmError::CacheMissing(_) => VdmError::NotFound(format!(
                "No vector cache file was found for {} - cannot clone. Aborting.",
                document.name
            )),
            other => other,
        })?;

        let namespace = connector.collection_name(&destination.slug);
        if !connector.namespace_exists(&namespace).await?
            && !(destination.slug.is_empty() && connector.has_default_namespace())
        {
            let dimensions = entries
                .first()
                .map(|entry| entry.values.len())
                .unwrap_or(DEFAULT_DIMENSIONS);
            connector.create_namespace(&namespace, dimensions).await?;
        }

        let (cloned, vectors) = copy_document(
            &self.ctx,
            connector.as_ref(),
            &namespace,
            &destination,
            &document.name,
            entries,
        )
        .await?;

        tracing::info!(
            document = %document.name,
            destination = %destination.slug,
            vectors,
            "Document cloned"
        );
        Ok(DocumentClone {
            document: cloned,
            destination,
            vectors,
        })
    }
}

async fn read_cache(ctx: &JobContext, document: &Document) -> Result<Vec<CacheEntry>> {
    ctx.cache
        .read_required(&VectorCacheStore::key_for(document))
        .await
}
