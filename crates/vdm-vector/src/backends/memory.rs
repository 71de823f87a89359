//! In-memory connector for tests
//!
//! Behaves like a real backend: namespaces must exist before writes,
//! pagination honours the run-marker filter in tagging mode, and call
//! counters allow asserting on chunking.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use vdm_core::{ConnectorType, Result, VdmError};

use crate::{
    NamespaceInfo, PageCursor, SimilarityResponse, VectorConnector, VectorMetadata, VectorRecord,
    RUN_MARKER_KEY, TAGGING_PAGE_SIZE,
};

/// In-memory vector database
pub struct MemoryConnector {
    kind: ConnectorType,
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, VectorRecord>>>,
    tagging: bool,
    page_size: usize,
    starter_delay: Option<Duration>,
    failing_ids: HashSet<String>,
    failing_texts: HashSet<String>,
    upsert_calls: AtomicUsize,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    tag_calls: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(kind: ConnectorType) -> Self {
        Self {
            kind,
            namespaces: RwLock::new(BTreeMap::new()),
            tagging: false,
            page_size: 100,
            starter_delay: None,
            failing_ids: HashSet::new(),
            failing_texts: HashSet::new(),
            upsert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            tag_calls: AtomicUsize::new(0),
        }
    }

    /// Paginate by run-marker tagging instead of offsets
    pub fn with_tagging(mut self) -> Self {
        self.tagging = true;
        self.page_size = TAGGING_PAGE_SIZE;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Constrained tier: only the default namespace, pause after writes
    pub fn with_starter_tier(mut self, delay: Duration) -> Self {
        self.starter_delay = Some(delay);
        self
    }

    /// Any upsert batch containing one of these ids fails
    pub fn failing_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.failing_ids = ids.into_iter().collect();
        self
    }

    /// Like `failing_on`, matched on the fragment text for re-keyed writes
    pub fn failing_on_text(mut self, texts: impl IntoIterator<Item = String>) -> Self {
        self.failing_texts = texts.into_iter().collect();
        self
    }

    /// Seed a namespace directly, bypassing counters
    pub async fn seed(&self, namespace: &str, records: Vec<VectorRecord>) {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id.clone(), record);
        }
    }

    /// Snapshot of a namespace, ordered by id
    pub async fn records(&self, namespace: &str) -> Vec<VectorRecord> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn tag_calls(&self) -> usize {
        self.tag_calls.load(Ordering::SeqCst)
    }

    fn missing(namespace: &str) -> VdmError {
        VdmError::NotFound(format!("namespace {namespace}"))
    }
}

fn dot(a: &[f64], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * f64::from(*y)).sum::<f64>() as f32
}

#[async_trait]
impl VectorConnector for MemoryConnector {
    fn kind(&self) -> ConnectorType {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        Ok(self
            .namespaces
            .read()
            .await
            .iter()
            .map(|(name, ns)| NamespaceInfo {
                name: name.clone(),
                vector_count: ns.len() as u64,
            })
            .collect())
    }

    async fn namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        Ok(self.namespaces.read().await.get(name).map(|ns| NamespaceInfo {
            name: name.to_string(),
            vector_count: ns.len() as u64,
        }))
    }

    async fn create_namespace(&self, name: &str, _dimensions: usize) -> Result<()> {
        if !self.supports_namespace(name) {
            return Err(VdmError::ValidationError(format!(
                "namespace {name} not available on this tier"
            )));
        }
        self.namespaces
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        if !self.can_drop_namespaces() {
            return Err(VdmError::ValidationError(
                "namespaces cannot be dropped on this tier".to_string(),
            ));
        }
        self.namespaces.write().await.remove(name);
        Ok(())
    }

    async fn upsert_batch(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if records.iter().any(|r| {
            self.failing_ids.contains(&r.id)
                || r.text().is_some_and(|t| self.failing_texts.contains(t))
        }) {
            return Err(VdmError::VectorDbError("batch rejected".to_string()));
        }

        let mut namespaces = self.namespaces.write().await;
        if namespace.is_empty() && self.has_default_namespace() {
            namespaces.entry(String::new()).or_default();
        }
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| Self::missing(namespace))?;
        for record in records {
            ns.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            for id in ids {
                ns.remove(id);
            }
        }
        Ok(())
    }

    async fn update_vector(&self, namespace: &str, record: &VectorRecord) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| Self::missing(namespace))?;
        match ns.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(VdmError::NotFound(format!("vector {}", record.id))),
        }
    }

    async fn fetch_vector(&self, namespace: &str, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(id))
            .cloned())
    }

    async fn similarity_response(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<SimilarityResponse> {
        let mut scored: Vec<(f32, VectorRecord)> = self
            .records(namespace)
            .await
            .into_iter()
            .map(|r| (dot(&r.values, query), r))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut response = SimilarityResponse::default();
        for (score, record) in scored.into_iter().take(top_k) {
            let text = record.text().unwrap_or_default().to_string();
            response.push(record.id, text, record.metadata, score);
        }
        Ok(response)
    }

    async fn get_metadata(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorMetadata>> {
        let namespaces = self.namespaces.read().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| ns.get(id))
            .map(|r| VectorMetadata {
                vector_id: r.id.clone(),
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    async fn index_dimensions(&self, namespace: &str) -> Result<usize> {
        Ok(self
            .records(namespace)
            .await
            .first()
            .map(|r| r.values.len())
            .unwrap_or(0))
    }

    async fn fetch_next_page(
        &self,
        namespace: &str,
        cursor: &mut PageCursor,
    ) -> Result<Vec<VectorRecord>> {
        let records = self.records(namespace).await;
        cursor.pages += 1;

        if self.tagging {
            return Ok(records
                .into_iter()
                .filter(|r| {
                    r.metadata.get(RUN_MARKER_KEY).and_then(|v| v.as_str())
                        != Some(cursor.run_marker.as_str())
                })
                .take(cursor.page_size)
                .collect());
        }

        let offset: usize = cursor
            .offset
            .as_deref()
            .and_then(|o| o.parse().ok())
            .unwrap_or(0);
        let page: Vec<VectorRecord> = records
            .into_iter()
            .skip(offset)
            .take(cursor.page_size)
            .collect();
        cursor.offset = Some((offset + page.len()).to_string());
        Ok(page)
    }

    async fn mark_seen(&self, namespace: &str, ids: &[String], cursor: &PageCursor) -> Result<()> {
        if !self.tagging {
            return Ok(());
        }

        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            for id in ids {
                if let Some(record) = ns.get_mut(id) {
                    record.metadata.insert(
                        RUN_MARKER_KEY.to_string(),
                        Value::String(cursor.run_marker.clone()),
                    );
                }
            }
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn supports_namespace(&self, name: &str) -> bool {
        self.starter_delay.is_none() || name.is_empty()
    }

    fn has_default_namespace(&self) -> bool {
        self.kind == ConnectorType::Pinecone
    }

    fn can_drop_namespaces(&self) -> bool {
        self.starter_delay.is_none()
    }

    fn supports_metadata_updates(&self) -> bool {
        self.kind != ConnectorType::Weaviate
    }

    fn write_delay(&self) -> Option<Duration> {
        self.starter_delay
    }
}
