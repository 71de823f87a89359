//! In-memory ledgers for tests
//!
//! Mirror the PostgreSQL stores closely enough for engine tests: unique
//! doc ids, cascading deletes and recorded job updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::jobs::{JobId, JobLedger, JobReport, JobStatus, Notification};
use crate::ledger::LedgerRepository;
use crate::{
    ConnectorConfig, Document, DocumentVector, NewDocument, NewDocumentVector, NewWorkspace,
    Organization, Result, VdmError, Workspace,
};

#[derive(Default)]
struct Tables {
    organizations: BTreeMap<i64, Organization>,
    connectors: BTreeMap<i64, ConnectorConfig>,
    workspaces: BTreeMap<i64, Workspace>,
    documents: BTreeMap<i64, Document>,
    vectors: BTreeMap<i64, DocumentVector>,
}

/// Ledger backed by ordered maps
#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert an organization with its connector
    pub async fn add_organization(&self, name: &str, connector: Option<ConnectorConfig>) -> i64 {
        let id = self.mint_id();
        let mut tables = self.tables.write().await;
        tables.organizations.insert(
            id,
            Organization {
                id,
                name: name.to_string(),
                slug: name.to_lowercase().replace(' ', "-"),
            },
        );
        if let Some(mut connector) = connector {
            connector.organization_id = id;
            connector.id = self.mint_id();
            tables.connectors.insert(id, connector);
        }
        id
    }

    pub async fn all_documents(&self) -> Vec<Document> {
        self.tables.read().await.documents.values().cloned().collect()
    }

    pub async fn all_vectors(&self) -> Vec<DocumentVector> {
        self.tables.read().await.vectors.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerRepository for MemoryLedger {
    async fn organization(&self, id: i64) -> Result<Option<Organization>> {
        Ok(self.tables.read().await.organizations.get(&id).cloned())
    }

    async fn connector_for(&self, organization_id: i64) -> Result<Option<ConnectorConfig>> {
        Ok(self.tables.read().await.connectors.get(&organization_id).cloned())
    }

    async fn workspaces_for(&self, organization_id: i64) -> Result<Vec<Workspace>> {
        let tables = self.tables.read().await;
        Ok(tables
            .workspaces
            .values()
            .filter(|w| w.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn workspace(&self, id: i64) -> Result<Option<Workspace>> {
        Ok(self.tables.read().await.workspaces.get(&id).cloned())
    }

    async fn workspace_by_slug(
        &self,
        organization_id: i64,
        slug: &str,
    ) -> Result<Option<Workspace>> {
        let tables = self.tables.read().await;
        Ok(tables
            .workspaces
            .values()
            .find(|w| w.organization_id == organization_id && w.slug == slug)
            .cloned())
    }

    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<Workspace> {
        let mut tables = self.tables.write().await;
        if tables
            .workspaces
            .values()
            .any(|w| w.organization_id == workspace.organization_id && w.slug == workspace.slug)
        {
            return Err(VdmError::DatabaseError(format!(
                "duplicate workspace slug {}",
                workspace.slug
            )));
        }
        let id = self.mint_id();
        let created = Workspace {
            id,
            name: workspace.name.clone(),
            slug: workspace.slug.clone(),
            organization_id: workspace.organization_id,
        };
        tables.workspaces.insert(id, created.clone());
        Ok(created)
    }

    async fn delete_workspace(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.workspaces.remove(&id);
        tables.documents.retain(|_, d| d.workspace_id != id);
        tables.vectors.retain(|_, v| v.workspace_id != id);
        Ok(())
    }

    async fn document(&self, id: i64) -> Result<Option<Document>> {
        Ok(self.tables.read().await.documents.get(&id).cloned())
    }

    async fn documents_for_workspace(&self, workspace_id: i64) -> Result<Vec<Document>> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .filter(|d| d.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn documents_by_doc_ids(&self, doc_ids: &[String]) -> Result<Vec<Document>> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .filter(|d| doc_ids.contains(&d.doc_id))
            .cloned()
            .collect())
    }

    async fn create_document(&self, document: &NewDocument) -> Result<Document> {
        let mut tables = self.tables.write().await;
        if tables.documents.values().any(|d| d.doc_id == document.doc_id) {
            return Err(VdmError::DatabaseError(format!(
                "duplicate docId {}",
                document.doc_id
            )));
        }
        let id = self.mint_id();
        let created = Document {
            id,
            doc_id: document.doc_id.clone(),
            name: document.name.clone(),
            workspace_id: document.workspace_id,
            organization_id: document.organization_id,
        };
        tables.documents.insert(id, created.clone());
        Ok(created)
    }

    async fn create_documents(&self, documents: &[NewDocument]) -> Result<u64> {
        let mut count = 0;
        for document in documents {
            self.create_document(document).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn delete_document(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.documents.remove(&id);
        tables.vectors.retain(|_, v| v.document_id != id);
        Ok(())
    }

    async fn delete_documents_for_workspace(&self, workspace_id: i64) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.documents.len();
        tables.documents.retain(|_, d| d.workspace_id != workspace_id);
        tables.vectors.retain(|_, v| v.workspace_id != workspace_id);
        Ok((before - tables.documents.len()) as u64)
    }

    async fn document_vector(&self, id: i64) -> Result<Option<DocumentVector>> {
        Ok(self.tables.read().await.vectors.get(&id).cloned())
    }

    async fn vectors_for_document(&self, document_id: i64) -> Result<Vec<DocumentVector>> {
        let tables = self.tables.read().await;
        Ok(tables
            .vectors
            .values()
            .filter(|v| v.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn create_document_vectors(&self, vectors: &[NewDocumentVector]) -> Result<u64> {
        let mut tables = self.tables.write().await;
        for vector in vectors {
            let id = self.mint_id();
            tables.vectors.insert(
                id,
                DocumentVector {
                    id,
                    doc_id: vector.doc_id.clone(),
                    vector_id: vector.vector_id.clone(),
                    document_id: vector.document_id,
                    workspace_id: vector.workspace_id,
                    organization_id: vector.organization_id,
                },
            );
        }
        Ok(vectors.len() as u64)
    }

    async fn count_document_vectors(&self, workspace_id: i64) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .vectors
            .values()
            .filter(|v| v.workspace_id == workspace_id)
            .count() as u64)
    }

    async fn delete_document_vector(&self, id: i64) -> Result<()> {
        self.tables.write().await.vectors.remove(&id);
        Ok(())
    }
}

/// Job ledger recording every call for assertions
#[derive(Default)]
pub struct MemoryJobLedger {
    updates: RwLock<Vec<(JobId, JobStatus, JobReport)>>,
    notifications: RwLock<Vec<(i64, Notification)>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn updates(&self) -> Vec<(JobId, JobStatus, JobReport)> {
        self.updates.read().await.clone()
    }

    /// Most recent status recorded for a job
    pub async fn last_status(&self, job_id: JobId) -> Option<(JobStatus, JobReport)> {
        self.updates
            .read()
            .await
            .iter()
            .rev()
            .find(|(id, _, _)| *id == job_id)
            .map(|(_, status, report)| (*status, report.clone()))
    }

    pub async fn notifications(&self) -> Vec<(i64, Notification)> {
        self.notifications.read().await.clone()
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn update_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        report: &JobReport,
    ) -> Result<()> {
        self.updates
            .write()
            .await
            .push((job_id, status, report.clone()));
        Ok(())
    }

    async fn notify(&self, organization_id: i64, notification: &Notification) -> Result<()> {
        self.notifications
            .write()
            .await
            .push((organization_id, notification.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectorType;

    #[tokio::test]
    async fn test_document_delete_cascades_to_vectors() {
        let ledger = MemoryLedger::new();
        let org = ledger
            .add_organization(
                "Acme",
                Some(ConnectorConfig::new(
                    0,
                    ConnectorType::Qdrant,
                    serde_json::json!({}),
                )),
            )
            .await;
        let workspace = ledger
            .create_workspace(&NewWorkspace {
                name: "Docs".into(),
                slug: "docs".into(),
                organization_id: org,
            })
            .await
            .unwrap();
        let document = ledger
            .create_document(&NewDocument::minted("a.txt", &workspace))
            .await
            .unwrap();
        ledger
            .create_document_vectors(&[
                NewDocumentVector::for_document(&document, "v1"),
                NewDocumentVector::for_document(&document, "v2"),
            ])
            .await
            .unwrap();

        assert_eq!(ledger.count_document_vectors(workspace.id).await.unwrap(), 2);
        ledger.delete_document(document.id).await.unwrap();
        assert_eq!(ledger.count_document_vectors(workspace.id).await.unwrap(), 0);
        assert_eq!(
            ledger.connector_for(org).await.unwrap().unwrap().organization_id,
            org
        );
    }

    #[tokio::test]
    async fn test_duplicate_doc_id_is_rejected() {
        let ledger = MemoryLedger::new();
        let workspace = ledger
            .create_workspace(&NewWorkspace {
                name: "Docs".into(),
                slug: "docs".into(),
                organization_id: 1,
            })
            .await
            .unwrap();
        let doc = NewDocument::minted("a.txt", &workspace);
        ledger.create_document(&doc).await.unwrap();
        assert!(ledger.create_document(&doc).await.is_err());
    }
}
