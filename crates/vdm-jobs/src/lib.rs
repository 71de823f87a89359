//! VDM Jobs - Background jobs over the vector databases
//!
//! Each job loads its records from the ledger, drives one or two vector
//! connectors and the vector cache, and reports every terminal outcome to
//! the job ledger:
//! - Migration: copy an organization's vectors to another backend
//! - Reconciliation sync: rebuild a workspace's ledger rows and cache from
//!   the remote namespace
//! - Embedding update: re-embed one fragment across all representations
//! - Metadata update: replace a fragment's metadata without re-embedding
//! - Workspace and document cloning inside one organization
//! - Fragment, document and workspace deletion, and organization reset
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vdm_core::{
    ConnectorConfig, JobId, JobLedger, JobsConfig, LedgerRepository, Organization, Result,
    VdmError, Workspace,
};
use vdm_vector::{select_connector, Metadata, VectorCacheStore, VectorConnector};

pub mod clone;
pub mod documents;
pub mod embedding_update;
pub mod fragment_delete;
pub mod metadata_update;
pub mod migration;
pub mod report;
pub mod reset;
pub mod sync;
pub mod workspace;
pub mod workspace_delete;

pub use clone::{DocumentClone, DocumentCloneJob, WorkspaceClone, WorkspaceCloneJob};
pub use documents::DocumentDeleteJob;
pub use embedding_update::{EmbeddingUpdate, EmbeddingUpdateEngine};
pub use fragment_delete::FragmentDeleteJob;
pub use metadata_update::{MetadataUpdate, MetadataUpdateJob};
pub use migration::{MigrationEngine, MigrationSummary};
pub use report::JobReporter;
pub use reset::{OrganizationReset, OrganizationResetJob};
pub use sync::{SyncEngine, SyncSummary};
pub use workspace::{create_workspace, slugify};
pub use workspace_delete::{WorkspaceDeleteJob, WorkspaceDeletion};

// ============================================================================
// Connector resolution
// ============================================================================

/// Turns a stored connector record into a live adapter
pub trait ConnectorResolver: Send + Sync {
    fn resolve(&self, config: &ConnectorConfig) -> Result<Arc<dyn VectorConnector>>;
}

/// Resolver backed by the real Chroma/Pinecone/Qdrant/Weaviate adapters
pub struct BackendResolver {
    jobs: JobsConfig,
}

impl BackendResolver {
    pub fn new(jobs: JobsConfig) -> Self {
        Self { jobs }
    }
}

impl ConnectorResolver for BackendResolver {
    fn resolve(&self, config: &ConnectorConfig) -> Result<Arc<dyn VectorConnector>> {
        select_connector(config, &self.jobs).map(Arc::from)
    }
}

// ============================================================================
// Job context
// ============================================================================

/// Collaborators shared by every job
#[derive(Clone)]
pub struct JobContext {
    pub ledger: Arc<dyn LedgerRepository>,
    pub jobs: Arc<dyn JobLedger>,
    pub cache: Arc<VectorCacheStore>,
    pub connectors: Arc<dyn ConnectorResolver>,
}

impl JobContext {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        jobs: Arc<dyn JobLedger>,
        cache: Arc<VectorCacheStore>,
        connectors: Arc<dyn ConnectorResolver>,
    ) -> Self {
        Self {
            ledger,
            jobs,
            cache,
            connectors,
        }
    }

    pub fn reporter(&self, job_id: JobId) -> JobReporter {
        JobReporter::new(Arc::clone(&self.jobs), job_id)
    }

    pub(crate) async fn organization(&self, id: i64) -> Result<Organization> {
        self.ledger
            .organization(id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("organization {id}")))
    }

    pub(crate) async fn workspace(&self, id: i64) -> Result<Workspace> {
        self.ledger
            .workspace(id)
            .await?
            .ok_or_else(|| VdmError::NotFound(format!("workspace {id}")))
    }

    /// Connector record of an organization; its absence is `MissingConnector`
    pub(crate) async fn connector_config(
        &self,
        organization: &Organization,
    ) -> Result<ConnectorConfig> {
        self.ledger
            .connector_for(organization.id)
            .await?
            .ok_or_else(|| {
                VdmError::MissingConnector(format!(
                    "Organization {} does not have a connected vector database",
                    organization.name
                ))
            })
    }

    /// Live, reachable connector for an organization
    pub(crate) async fn connector(
        &self,
        organization: &Organization,
    ) -> Result<Arc<dyn VectorConnector>> {
        let config = self.connector_config(organization).await?;
        let connector = self.connectors.resolve(&config)?;
        connector.connect().await?;
        Ok(connector)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Copy every vector of `organization_id` into `destination_organization_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPayload {
    pub organization_id: i64,
    pub destination_organization_id: i64,
    pub job_id: JobId,
}

/// Rebuild one workspace from its remote namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub workspace_id: i64,
    pub job_id: JobId,
}

/// Re-embed one fragment with new text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEmbeddingPayload {
    pub document_vector_id: i64,
    pub new_text: String,
    pub job_id: JobId,
}

/// Remove one fragment everywhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFragmentPayload {
    pub document_vector_id: i64,
    pub job_id: JobId,
}

/// Remove one document everywhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocumentPayload {
    pub document_id: i64,
    pub job_id: JobId,
}

/// Replace one fragment's metadata without re-embedding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataPayload {
    pub document_vector_id: i64,
    pub new_metadata: Metadata,
    pub job_id: JobId,
}

/// Copy a workspace, under a new name, inside its organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneWorkspacePayload {
    pub workspace_id: i64,
    pub new_workspace_name: String,
    pub job_id: JobId,
}

/// Copy one document into another workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneDocumentPayload {
    pub document_id: i64,
    pub destination_workspace_id: i64,
    pub job_id: JobId,
}

/// Remove a workspace, its namespace and its documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteWorkspacePayload {
    pub workspace_id: i64,
    pub job_id: JobId,
}

/// Empty an organization's vector database and drop its workspaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOrganizationPayload {
    pub organization_id: i64,
    pub job_id: JobId,
}

/// Failures that touch state shared by the whole job and must abort it
/// rather than skip one workspace or document
pub(crate) fn aborts_job(err: &VdmError) -> bool {
    matches!(
        err,
        VdmError::ConnectionError { .. }
            | VdmError::DatabaseError(_)
            | VdmError::MissingConnector(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_format() {
        let payload: MigrationPayload = serde_json::from_value(json!({
            "organizationId": 1,
            "destinationOrganizationId": 2,
            "jobId": 7
        }))
        .unwrap();
        assert_eq!(payload.destination_organization_id, 2);

        let payload: UpdateEmbeddingPayload = serde_json::from_value(json!({
            "documentVectorId": 3,
            "newText": "hello",
            "jobId": 8
        }))
        .unwrap();
        assert_eq!(payload.new_text, "hello");

        let payload: UpdateMetadataPayload = serde_json::from_value(json!({
            "documentVectorId": 4,
            "newMetadata": { "title": "a.txt" },
            "jobId": 9
        }))
        .unwrap();
        assert_eq!(payload.new_metadata["title"], json!("a.txt"));

        let payload: CloneWorkspacePayload = serde_json::from_value(json!({
            "workspaceId": 5,
            "newWorkspaceName": "Copy",
            "jobId": 10
        }))
        .unwrap();
        assert_eq!(payload.new_workspace_name, "Copy");
    }

    #[test]
    fn test_abort_classification() {
        assert!(aborts_job(&VdmError::unreachable("down")));
        assert!(aborts_job(&VdmError::DatabaseError("gone".into())));
        assert!(!aborts_job(&VdmError::CacheMissing("x".into())));
        assert!(!aborts_job(&VdmError::VectorDbError("rejected".into())));
    }
}
