mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{metadata, Harness};
use serde_json::json;
use vdm_core::{ConnectorType, JobStatus, LedgerRepository};
use vdm_jobs::{SyncEngine, SyncPayload};
use vdm_vector::{MemoryConnector, VectorCacheStore, VectorConnector, VectorRecord};

fn remote_records(count: usize, documents: usize) -> Vec<VectorRecord> {
    (0..count)
        .map(|i| {
            VectorRecord::new(
                format!("remote-{i:04}"),
                vec![i as f64, 0.0],
                metadata(json!({
                    "title": format!("doc-{}.txt", i % documents),
                    "text": format!("line {i}\n"),
                })),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_tagging_sync_replaces_local_state() {
    let harness = Harness::new();
    let connector = Arc::new(
        MemoryConnector::new(ConnectorType::Pinecone)
            .with_tagging()
            .with_page_size(7),
    );
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;

    // Stale local state that must not survive
    let (stale, _) = harness
        .embedded_document(&connector, &workspace, "stale.txt", 2)
        .await;
    connector
        .delete_ids("docs", &[format!("{}-0", stale.doc_id), format!("{}-1", stale.doc_id)])
        .await
        .unwrap();
    connector.seed("docs", remote_records(30, 3)).await;

    let summary = SyncEngine::new(harness.ctx())
        .run(&SyncPayload {
            workspace_id: workspace.id,
            job_id: 10,
        })
        .await
        .unwrap();
    assert_eq!(summary.vectors, 30);
    assert_eq!(summary.documents, 3);

    let remote_count = connector.namespace("docs").await.unwrap().unwrap().vector_count;
    assert_eq!(
        harness.ledger.count_document_vectors(workspace.id).await.unwrap(),
        remote_count
    );

    let documents = harness.ledger.documents_for_workspace(workspace.id).await.unwrap();
    assert!(documents.iter().all(|d| d.id != stale.id && d.name != "stale.txt"));
    assert!(!harness.cache.exists(&VectorCacheStore::key_for(&stale)).await);

    for document in &documents {
        let entries = harness
            .cache
            .read_required(&VectorCacheStore::key_for(document))
            .await
            .unwrap();
        assert_eq!(entries.len(), 10);
        assert!(entries.iter().all(|e| !e.metadata.contains_key("runId")));
        assert_eq!(entries[0].metadata["loc.lines.from"], json!(1));
        assert_eq!(entries[1].metadata["loc.lines.from"], json!(3));
    }

    let (status, _) = harness.jobs.last_status(10).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    let notifications = harness.jobs.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(
        notifications[0].1.text_content,
        "Your Pinecone namespace has been fully synced."
    );
    assert_eq!(
        notifications[0].1.link.as_deref(),
        Some("/dashboard/acme/workspace/docs")
    );
}

#[tokio::test]
async fn test_pagination_terminates_without_duplicates() {
    for (total, page_size) in [(1, 1000), (5, 2), (1000, 1000), (2501, 1000), (37, 10)] {
        let connector = MemoryConnector::new(ConnectorType::Pinecone)
            .with_tagging()
            .with_page_size(page_size);
        connector.seed("ns", remote_records(total, 4)).await;

        let harness = Harness::new();
        let connector = Arc::new(connector);
        let org = harness.organization("Acme", connector.clone()).await;
        let workspace = harness.workspace(org, "ns").await;

        let summary = SyncEngine::new(harness.ctx())
            .run(&SyncPayload {
                workspace_id: workspace.id,
                job_id: 11,
            })
            .await
            .unwrap();

        assert_eq!(summary.vectors, total);
        assert_eq!(summary.pages, total.div_ceil(page_size) + 1);

        let ids: HashSet<String> = harness
            .ledger
            .all_vectors()
            .await
            .into_iter()
            .map(|v| v.vector_id)
            .collect();
        assert_eq!(ids.len(), total);
    }
}

#[tokio::test]
async fn test_offset_backend_sync() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant).with_page_size(4));
    connector.seed("docs", remote_records(9, 2)).await;
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;

    let summary = SyncEngine::new(harness.ctx())
        .run(&SyncPayload {
            workspace_id: workspace.id,
            job_id: 12,
        })
        .await
        .unwrap();

    assert_eq!(summary.vectors, 9);
    assert_eq!(connector.tag_calls(), 0);
    assert_eq!(
        harness.ledger.count_document_vectors(workspace.id).await.unwrap(),
        9
    );
}

#[tokio::test]
async fn test_missing_namespace_is_nothing_to_do() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Chroma));
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "ghost").await;

    let summary = SyncEngine::new(harness.ctx())
        .run(&SyncPayload {
            workspace_id: workspace.id,
            job_id: 13,
        })
        .await
        .unwrap();
    assert_eq!(summary.vectors, 0);

    let (status, report) = harness.jobs.last_status(13).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert!(report.message.contains("nothing to do"));
    assert!(harness.jobs.notifications().await.is_empty());
}

#[tokio::test]
async fn test_empty_namespace_is_nothing_to_do() {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Chroma));
    connector.create_namespace("empty", 3).await.unwrap();
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "empty").await;

    SyncEngine::new(harness.ctx())
        .run(&SyncPayload {
            workspace_id: workspace.id,
            job_id: 14,
        })
        .await
        .unwrap();

    let (status, report) = harness.jobs.last_status(14).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(
        report.message,
        "Chroma namespace empty has no data - nothing to do."
    );
}

#[tokio::test]
async fn test_starter_tier_pauses_between_pages() {
    let harness = Harness::new();
    let delay = Duration::from_millis(25);
    let connector = Arc::new(
        MemoryConnector::new(ConnectorType::Pinecone)
            .with_tagging()
            .with_page_size(2)
            .with_starter_tier(delay),
    );
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "").await;
    connector.seed("", remote_records(5, 1)).await;

    let started = Instant::now();
    let summary = SyncEngine::new(harness.ctx())
        .run(&SyncPayload {
            workspace_id: workspace.id,
            job_id: 15,
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Three non-empty pages, each followed by a pause, then the empty page
    assert_eq!(summary.pages, 4);
    assert!(elapsed >= delay * 3, "elapsed {elapsed:?}");
    assert_eq!(summary.vectors, 5);
    assert_eq!(summary.documents, 1);
    assert_eq!(connector.tag_calls(), 3);

    let documents = harness.ledger.documents_for_workspace(workspace.id).await.unwrap();
    let entries = harness
        .cache
        .read_required(&VectorCacheStore::key_for(&documents[0]))
        .await
        .unwrap();
    let ids: HashSet<&str> = entries.iter().map(|e| e.vector_db_id.as_str()).collect();
    assert_eq!(ids.len(), 5);
}
