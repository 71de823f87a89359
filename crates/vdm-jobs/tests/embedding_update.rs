mod common;

use std::sync::Arc;

use common::{FixedEmbedder, Harness};
use serde_json::json;
use vdm_core::{ConnectorType, JobStatus, LedgerRepository, VdmError};
use vdm_jobs::{EmbeddingUpdateEngine, UpdateEmbeddingPayload};
use vdm_vector::{MemoryConnector, VectorCacheStore, VectorConnector};

struct Fixture {
    harness: Harness,
    connector: Arc<MemoryConnector>,
    embedder: Arc<FixedEmbedder>,
    cache_key: String,
    fragment_ids: Vec<i64>,
    vector_ids: Vec<String>,
}

async fn fixture() -> Fixture {
    let harness = Harness::new();
    let connector = Arc::new(MemoryConnector::new(ConnectorType::Qdrant));
    let org = harness.organization("Acme", connector.clone()).await;
    let workspace = harness.workspace(org, "docs").await;
    let (document, entries) = harness
        .embedded_document(&connector, &workspace, "notes.md", 3)
        .await;

    let fragments = harness.ledger.vectors_for_document(document.id).await.unwrap();
    Fixture {
        connector,
        embedder: Arc::new(FixedEmbedder::new(vec![9.0, 9.0, 9.0])),
        cache_key: VectorCacheStore::key_for(&document),
        fragment_ids: fragments.iter().map(|f| f.id).collect(),
        vector_ids: entries.into_iter().map(|e| e.vector_db_id).collect(),
        harness,
    }
}

fn engine(fixture: &Fixture) -> EmbeddingUpdateEngine {
    EmbeddingUpdateEngine::new(fixture.harness.ctx(), fixture.embedder.clone())
}

#[tokio::test]
async fn test_update_touches_only_target_entry() {
    let fixture = fixture().await;
    let before = fixture
        .harness
        .cache
        .read_required(&fixture.cache_key)
        .await
        .unwrap();

    let update = engine(&fixture)
        .run(&UpdateEmbeddingPayload {
            document_vector_id: fixture.fragment_ids[1],
            new_text: "a brand new chunk".to_string(),
            job_id: 20,
        })
        .await
        .unwrap();
    assert_eq!(update.old_text.as_deref(), Some("chunk 1"));

    let after = fixture
        .harness
        .cache
        .read_required(&fixture.cache_key)
        .await
        .unwrap();
    assert_eq!(after[0], before[0]);
    assert_eq!(after[2], before[2]);

    let updated = &after[1];
    assert_eq!(updated.vector_db_id, fixture.vector_ids[1]);
    assert_eq!(updated.values, vec![9.0, 9.0, 9.0]);
    assert_eq!(updated.metadata["title"], json!("notes.md"));
    assert_eq!(updated.metadata["text"], json!("a brand new chunk"));
    assert_eq!(updated.metadata["wordCount"], json!(4));
    assert!(updated.metadata["token_count_estimate"].as_u64().unwrap() > 0);

    let remote = fixture
        .connector
        .fetch_vector("docs", &fixture.vector_ids[1])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.values, updated.values);
    assert_eq!(remote.metadata, updated.metadata);

    let (status, report) = fixture.harness.jobs.last_status(20).await.unwrap();
    assert_eq!(status, JobStatus::Complete);
    assert_eq!(
        report.details.unwrap()["oldText"],
        json!("chunk 1")
    );
}

#[tokio::test]
async fn test_empty_text_changes_nothing() {
    let fixture = fixture().await;
    let cache_path = fixture.harness.cache.path(&fixture.cache_key);
    let bytes_before = std::fs::read(&cache_path).unwrap();
    let remote_before = fixture.connector.records("docs").await;

    let err = engine(&fixture)
        .run(&UpdateEmbeddingPayload {
            document_vector_id: fixture.fragment_ids[0],
            new_text: String::new(),
            job_id: 21,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VdmError::ValidationError(_)));

    assert_eq!(std::fs::read(&cache_path).unwrap(), bytes_before);
    assert_eq!(fixture.connector.records("docs").await, remote_before);
    assert_eq!(fixture.connector.update_calls(), 0);
    assert_eq!(fixture.embedder.calls(), 0);

    let (status, _) = fixture.harness.jobs.last_status(21).await.unwrap();
    assert_eq!(status, JobStatus::Failed);
}

#[tokio::test]
async fn test_missing_remote_vector_is_not_found() {
    let fixture = fixture().await;
    fixture
        .connector
        .delete_ids("docs", &[fixture.vector_ids[2].clone()])
        .await
        .unwrap();

    let err = engine(&fixture)
        .run(&UpdateEmbeddingPayload {
            document_vector_id: fixture.fragment_ids[2],
            new_text: "replacement".to_string(),
            job_id: 22,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, VdmError::NotFound(_)));
    assert!(!err.is_retryable());
    assert_eq!(fixture.embedder.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_updates_of_one_document_keep_every_entry() {
    let fixture = fixture().await;
    let engine = Arc::new(engine(&fixture));

    let tasks: Vec<_> = fixture
        .fragment_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let engine = Arc::clone(&engine);
            let payload = UpdateEmbeddingPayload {
                document_vector_id: *id,
                new_text: format!("rewritten {i}"),
                job_id: 30 + i as i64,
            };
            tokio::spawn(async move { engine.run(&payload).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entries = fixture
        .harness
        .cache
        .read_required(&fixture.cache_key)
        .await
        .unwrap();
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.metadata["text"], json!(format!("rewritten {i}")));
    }
}
