//! Shared fixtures for job tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use vdm_core::memory::{MemoryJobLedger, MemoryLedger};
use vdm_core::{
    ConnectorConfig, Document, LedgerRepository, NewDocument, NewDocumentVector, NewWorkspace,
    Result, VdmError, Workspace,
};
use vdm_jobs::{ConnectorResolver, JobContext};
use vdm_vector::{
    CacheEntry, EmbeddingClient, Metadata, MemoryConnector, VectorCacheStore, VectorConnector,
    VectorRecord,
};

/// Hands out pre-registered connectors by organization id
#[derive(Default)]
pub struct StaticResolver {
    connectors: Mutex<HashMap<i64, Arc<dyn VectorConnector>>>,
}

impl StaticResolver {
    pub fn register(&self, organization_id: i64, connector: Arc<dyn VectorConnector>) {
        self.connectors
            .lock()
            .unwrap()
            .insert(organization_id, connector);
    }
}

impl ConnectorResolver for StaticResolver {
    fn resolve(&self, config: &ConnectorConfig) -> Result<Arc<dyn VectorConnector>> {
        self.connectors
            .lock()
            .unwrap()
            .get(&config.organization_id)
            .cloned()
            .ok_or_else(|| VdmError::misconfigured("no connector registered"))
    }
}

/// Embedder returning a fixed vector and counting calls
pub struct FixedEmbedder {
    pub vector: Vec<f32>,
    pub calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingClient for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }

    fn dimension(&self) -> usize {
        self.vector.len()
    }
}

pub fn metadata(value: serde_json::Value) -> Metadata {
    value.as_object().cloned().unwrap()
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub jobs: Arc<MemoryJobLedger>,
    pub cache: Arc<VectorCacheStore>,
    pub resolver: Arc<StaticResolver>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            jobs: Arc::new(MemoryJobLedger::new()),
            cache: Arc::new(VectorCacheStore::new(dir.path().join("vector-cache"))),
            resolver: Arc::new(StaticResolver::default()),
            _dir: dir,
        }
    }

    pub fn ctx(&self) -> JobContext {
        JobContext::new(
            self.ledger.clone(),
            self.jobs.clone(),
            self.cache.clone(),
            self.resolver.clone(),
        )
    }

    /// Organization bound to `connector`
    pub async fn organization(&self, name: &str, connector: Arc<MemoryConnector>) -> i64 {
        let config = ConnectorConfig::new(0, connector.kind(), json!({}));
        let id = self.ledger.add_organization(name, Some(config)).await;
        self.resolver.register(id, connector);
        id
    }

    pub async fn workspace(&self, organization_id: i64, slug: &str) -> Workspace {
        self.ledger
            .create_workspace(&NewWorkspace {
                name: slug.to_string(),
                slug: slug.to_string(),
                organization_id,
            })
            .await
            .unwrap()
    }

    /// Document with `count` fragments stored remotely, in the ledger and
    /// in the cache
    pub async fn embedded_document(
        &self,
        connector: &MemoryConnector,
        workspace: &Workspace,
        name: &str,
        count: usize,
    ) -> (Document, Vec<CacheEntry>) {
        let document = self
            .ledger
            .create_document(&NewDocument::minted(name, workspace))
            .await
            .unwrap();

        let entries: Vec<CacheEntry> = (0..count)
            .map(|i| CacheEntry {
                vector_db_id: format!("{}-{i}", document.doc_id),
                values: vec![i as f64, 1.0, 0.5],
                metadata: metadata(json!({ "title": name, "text": format!("chunk {i}") })),
            })
            .collect();

        let records: Vec<VectorRecord> = entries.iter().cloned().map(VectorRecord::from).collect();
        connector.seed(&workspace.slug, records).await;

        let fragments: Vec<NewDocumentVector> = entries
            .iter()
            .map(|e| NewDocumentVector::for_document(&document, e.vector_db_id.clone()))
            .collect();
        self.ledger.create_document_vectors(&fragments).await.unwrap();

        self.cache
            .write(&VectorCacheStore::key_for(&document), &entries)
            .await
            .unwrap();

        (document, entries)
    }
}
