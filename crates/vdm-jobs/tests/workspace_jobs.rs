mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{metadata, Harness};
use serde_json::json;
use vdm_core::{ConnectorType, JobStatus, LedgerRepository};
use vdm_jobs::{
    CloneDocumentPayload, CloneWorkspacePayload, DeleteWorkspacePayload, DocumentCloneJob,
    OrganizationResetJob, ResetOrganizationPayload, WorkspaceCloneJob, WorkspaceDeleteJob,
};
use vdm_vector::{MemoryConnector, VectorCacheStore, VectorConnector, VectorRecord};

#[tokio::test]
async fn test_clone_workspace_copies_every_document() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Chroma));
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;
    let (a, a_entries) = harness
        .embedded_document(&connector, &workspace, "a.txt", 2)
        .await;
    harness
        .embedded_document(&connector, &workspace, "b.txt", 3)
        .await;

    let clone = WorkspaceCloneJob::new(harness.ctx())
        .run(&CloneWorkspacePayload {
            workspace_id: workspace.id,
            new_workspace_name: "Docs Copy".into(),
            job_id: 70,
        })
        .await
        .unwrap();

    assert_eq!(clone.workspace.slug, "docs-copy");
    assert_eq!(clone.workspace.organization_id, org);
    assert_eq!(clone.cloned_documents, 2);
    assert_eq!(clone.cloned_vectors, 5);
    assert!(clone.skipped_documents.is_empty());

    assert_eq!(connector.records("docs").await.len(), 5);
    assert_eq!(connector.records("docs-copy").await.len(), 5);

    let copies = harness
        .ledger
        .documents_for_workspace(clone.workspace.id)
        .await
        .unwrap();
    assert_eq!(copies.len(), 2);
    let copy_of_a = copies.iter().find(|d| d.name == "a.txt").unwrap();
    assert_ne!(copy_of_a.doc_id, a.doc_id);

    let cached = harness
        .cache
        .read_required(&VectorCacheStore::key_for(copy_of_a))
        .await
        .unwrap();
    let source_ids: HashSet<&str> = a_entries.iter().map(|e| e.vector_db_id.as_str()).collect();
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|e| !source_ids.contains(e.vector_db_id.as_str())));
    assert_eq!(cached[0].values, a_entries[0].values);

    let (status, report) = harness.jobs.last_status(70).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(
        report.message,
        "Workspace docs embeddings cloned into Docs Copy successfully."
    );
}

#[tokio::test]
async fn test_clone_workspace_skips_uncached_documents() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant));
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;
    let (lost, _) = harness
        .embedded_document(&connector, &workspace, "lost.txt", 2)
        .await;
    harness
        .cache
        .delete(&VectorCacheStore::key_for(&lost))
        .await
        .unwrap();
    harness
        .embedded_document(&connector, &workspace, "kept.txt", 1)
        .await;

    let clone = WorkspaceCloneJob::new(harness.ctx())
        .run(&CloneWorkspacePayload {
            workspace_id: workspace.id,
            new_workspace_name: "Copy".into(),
            job_id: 71,
        })
        .await
        .unwrap();

    assert_eq!(clone.cloned_documents, 1);
    assert_eq!(clone.skipped_documents, vec!["lost.txt"]);
    assert_eq!(connector.records("copy").await.len(), 1);
}

#[tokio::test]
async fn test_clone_document_into_another_workspace() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant));
    let org = harness.organization("Acme", connector.clone()).await;
    let source = harness.workspace(org, "source").await;
    let destination = harness.workspace(org, "target").await;
    connector.create_namespace("target", 3).await.unwrap();
    let (document, _) = harness
        .embedded_document(&connector, &source, "guide.md", 3)
        .await;

    let clone = DocumentCloneJob::new(harness.ctx())
        .run(&CloneDocumentPayload {
            document_id: document.id,
            destination_workspace_id: destination.id,
            job_id: 72,
        })
        .await
        .unwrap();

    assert_eq!(clone.vectors, 3);
    assert_eq!(clone.document.workspace_id, destination.id);
    assert_ne!(clone.document.doc_id, document.doc_id);
    assert_eq!(connector.records("target").await.len(), 3);
    assert_eq!(connector.records("source").await.len(), 3);
    assert_eq!(
        harness.ledger.vectors_for_document(clone.document.id).await.unwrap().len(),
        3
    );

    let (status, report) = harness.jobs.last_status(72).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(report.message, "Document guide.md cloned to target completed.");
}

#[tokio::test]
async fn test_clone_document_without_cache_fails() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant));
    let org = harness.organization("Acme", connector.clone()).await;
    let source = harness.workspace(org, "source").await;
    let destination = harness.workspace(org, "target").await;
    let (document, _) = harness
        .embedded_document(&connector, &source, "guide.md", 3)
        .await;
    harness
        .cache
        .delete(&VectorCacheStore::key_for(&document))
        .await
        .unwrap();

    let result = DocumentCloneJob::new(harness.ctx())
        .run(&CloneDocumentPayload {
            document_id: document.id,
            destination_workspace_id: destination.id,
            job_id: 73,
        })
        .await;
    assert!(result.is_err());
    assert!(harness
        .ledger
        .documents_for_workspace(destination.id)
        .await
        .unwrap()
        .is_empty());

    let (status, report) = harness.jobs.last_status(73).await.unwrap();
    assert_eq!(status, JobStatus::Failed);
    assert!(report.error.unwrap().contains("cannot clone"));
}

#[tokio::test]
async fn test_delete_workspace_removes_namespace_rows_and_caches() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant));
    let org = harness.organization("Acme", connector.clone()).await;
    let doomed = harness.workspace(org, "docs").await;
    let kept = harness.workspace(org, "keep").await;
    let (a, _) = harness
        .embedded_document(&connector, &doomed, "a.txt", 2)
        .await;
    let (b, _) = harness
        .embedded_document(&connector, &doomed, "b.txt", 2)
        .await;
    let (survivor, _) = harness
        .embedded_document(&connector, &kept, "c.txt", 1)
        .await;

    let deletion = WorkspaceDeleteJob::new(harness.ctx())
        .run(&DeleteWorkspacePayload {
            workspace_id: doomed.id,
            job_id: 74,
        })
        .await
        .unwrap();
    assert!(deletion.namespace_found);
    assert_eq!(deletion.documents, 2);

    assert_eq!(connector.namespace("docs").await.unwrap(), None);
    assert!(harness.ledger.workspace(doomed.id).await.unwrap().is_none());
    assert!(harness
        .ledger
        .documents_for_workspace(doomed.id)
        .await
        .unwrap()
        .is_empty());
    for document in [&a, &b] {
        assert!(!harness.cache.exists(&VectorCacheStore::key_for(document)).await);
    }

    assert_eq!(connector.records("keep").await.len(), 1);
    assert!(harness.cache.exists(&VectorCacheStore::key_for(&survivor)).await);

    let (status, report) = harness.jobs.last_status(74).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(
        report.message,
        "Namespace docs deleted along with 2 vectorized documents."
    );
}

#[tokio::test]
async fn test_delete_workspace_without_remote_namespace() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Chroma));
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;
    let (document, _) = harness
        .embedded_document(&connector, &workspace, "a.txt", 2)
        .await;
    connector.delete_namespace("docs").await.unwrap();

    let deletion = WorkspaceDeleteJob::new(harness.ctx())
        .run(&DeleteWorkspacePayload {
            workspace_id: workspace.id,
            job_id: 75,
        })
        .await
        .unwrap();
    assert!(!deletion.namespace_found);
    assert!(harness.ledger.workspace(workspace.id).await.unwrap().is_none());
    assert!(!harness.cache.exists(&VectorCacheStore::key_for(&document)).await);

    let (_, report) = harness.jobs.last_status(75).await.unwrap();
    assert!(report.message.contains("nothing to do remotely"));
}

#[tokio::test]
async fn test_delete_workspace_on_starter_tier_deletes_known_ids() {
    let harness = Harness::new();
    let connector = Arc::new(
        MemoryConnector::new(ConnectorType::Pinecone).with_starter_tier(Duration::ZERO),
    );
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "").await;
    harness
        .embedded_document(&connector, &workspace, "big.txt", 250)
        .await;
    connector
        .seed(
            "",
            vec![VectorRecord::new(
                "untracked",
                vec![0.0, 0.0, 0.0],
                metadata(json!({ "text": "not in the ledger" })),
            )],
        )
        .await;

    WorkspaceDeleteJob::new(harness.ctx())
        .run(&DeleteWorkspacePayload {
            workspace_id: workspace.id,
            job_id: 76,
        })
        .await
        .unwrap();

    assert_eq!(connector.delete_calls(), 3);
    let remaining = connector.records("").await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "untracked");
    assert!(harness.ledger.workspaces_for(org).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_drops_every_namespace_and_workspace() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Chroma));
    let org = harness.organization("Acme", connector.clone()).await;
    let mut documents = Vec::new();
    for slug in ["alpha", "beta"] {
        let workspace = harness.workspace(org, slug).await;
        let (document, _) = harness
            .embedded_document(&connector, &workspace, "a.txt", 2)
            .await;
        documents.push(document);
    }
    connector.create_namespace("orphan", 3).await.unwrap();

    let reset = OrganizationResetJob::new(harness.ctx())
        .run(&ResetOrganizationPayload {
            organization_id: org,
            job_id: 77,
        })
        .await
        .unwrap();
    assert_eq!(reset.namespaces, 3);
    assert_eq!(reset.workspaces, 2);

    assert!(connector.namespaces().await.unwrap().is_empty());
    assert!(harness.ledger.workspaces_for(org).await.unwrap().is_empty());
    assert!(harness.ledger.all_documents().await.is_empty());
    for document in &documents {
        assert!(!harness.cache.exists(&VectorCacheStore::key_for(document)).await);
    }

    let (status, report) = harness.jobs.last_status(77).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(report.message, "All namespaces and vectors deleted from Chroma.");
}

#[tokio::test]
async fn test_reset_on_starter_tier_deletes_ledger_ids_in_chunks() {
    let harness = Harness::new();
    let connector = Arc::new(
        MemoryConnector::new(ConnectorType::Pinecone).with_starter_tier(Duration::ZERO),
    );
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "").await;
    harness
        .embedded_document(&connector, &workspace, "a.txt", 120)
        .await;

    OrganizationResetJob::new(harness.ctx())
        .run(&ResetOrganizationPayload {
            organization_id: org,
            job_id: 78,
        })
        .await
        .unwrap();

    assert_eq!(connector.delete_calls(), 2);
    assert!(connector.records("").await.is_empty());
    assert!(harness.ledger.workspaces_for(org).await.unwrap().is_empty());
    assert!(harness.ledger.all_vectors().await.is_empty());
}
