//! Workspace delete job
//!
//! Drops the workspace's remote namespace, every cache file of its
//! documents and its rows (documents and fragments cascade).

use serde_json::json;
use vdm_core::{Document, JobReport, Result, Workspace};
use vdm_vector::{VectorCacheStore, VectorConnector};

use crate::{DeleteWorkspacePayload, JobContext};

/// Ids per delete call when a namespace has to be emptied vector by vector
pub(crate) const ID_DELETE_CHUNK_SIZE: usize = 100;

/// Outcome of a workspace deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDeletion {
    pub workspace: Workspace,
    pub namespace_found: bool,
    pub documents: usize,
}

pub struct WorkspaceDeleteJob {
    ctx: JobContext,
}

impl WorkspaceDeleteJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, payload: &DeleteWorkspacePayload) -> Result<WorkspaceDeletion> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.delete(payload.workspace_id).await;
        reporter
            .finish(outcome, |deletion| {
                let message = if deletion.namespace_found {
                    format!(
                        "Namespace {} deleted along with {} vectorized documents.",
                        deletion.workspace.slug, deletion.documents
                    )
                } else {
                    format!(
                        "No namespace found with name {} - nothing to do remotely.",
                        deletion.workspace.slug
                    )
                };
                JobReport::message(message).with_details(json!({
                    "workspaceId": deletion.workspace.id,
                    "documentsRemoved": deletion.documents,
                }))
            })
            .await
    }

    async fn delete(&self, workspace_id: i64) -> Result<WorkspaceDeletion> {
        let workspace = self.ctx.workspace(workspace_id).await?;
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;
        let namespace = connector.collection_name(&workspace.slug);

        let namespace_found = connector.namespace_exists(&namespace).await?;
        if namespace_found {
            if connector.can_drop_namespaces() {
                connector.delete_namespace(&namespace).await?;
            } else {
                let ids = ledger_vector_ids(&self.ctx, &workspace).await?;
                delete_in_chunks(connector.as_ref(), &namespace, &ids).await?;
            }
        } else {
            tracing::info!(namespace = %namespace, "Namespace already gone remotely");
        }

        let documents = purge_local(&self.ctx, &workspace).await?;
        tracing::info!(
            workspace = %workspace.slug,
            documents,
            organization = %organization.name,
            "Workspace deleted"
        );
        Ok(WorkspaceDeletion {
            workspace,
            namespace_found,
            documents,
        })
    }
}

/// Every fragment vector id the ledger holds for a workspace
pub(crate) async fn ledger_vector_ids(ctx: &JobContext, workspace: &Workspace) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for document in ctx.ledger.documents_for_workspace(workspace.id).await? {
        ids.extend(
            ctx.ledger
                .vectors_for_document(document.id)
                .await?
                .into_iter()
                .map(|v| v.vector_id),
        );
    }
    Ok(ids)
}

pub(crate) async fn delete_in_chunks(
    connector: &dyn VectorConnector,
    namespace: &str,
    ids: &[String],
) -> Result<()> {
    for chunk in ids.chunks(ID_DELETE_CHUNK_SIZE) {
        connector.delete_ids(namespace, chunk).await?;
    }
    Ok(())
}

/// Remove the cache files and rows of a workspace; returns the number of
/// documents it held
pub(crate) async fn purge_local(ctx: &JobContext, workspace: &Workspace) -> Result<usize> {
    let documents: Vec<Document> = ctx.ledger.documents_for_workspace(workspace.id).await?;
    for document in &documents {
        ctx.cache
            .delete(&VectorCacheStore::key_for(document))
            .await?;
    }
    ctx.ledger.delete_workspace(workspace.id).await?;
    Ok(documents.len())
}
