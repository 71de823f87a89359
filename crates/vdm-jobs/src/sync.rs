//! Reconciliation sync engine
//!
//! Rebuilds a workspace's documents, fragment rows and cache files from
//! whatever the remote namespace holds right now. The local side is
//! replaced wholesale; the remote side is only ever read, apart from the
//! run-marker tags some backends need for pagination.
//!
//! Author: hephaex@gmail.com

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;
use vdm_core::{
    ConnectorType, Document, JobReport, NewDocument, NewDocumentVector, Notification,
    Organization, Result, VdmError, Workspace,
};
use vdm_vector::{
    CacheEntry, Metadata, PageCursor, VectorCacheStore, VectorConnector, VectorRecord,
    RUN_MARKER_KEY,
};

use crate::{JobContext, SyncPayload};

/// Who hears about a finished sync, and for which backend
type NotificationTarget = (Organization, Workspace, ConnectorType);

/// Outcome of a sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub documents: usize,
    pub vectors: usize,
    pub pages: usize,
}

// ============================================================================
// Document reconstruction
// ============================================================================

/// Fragments regrouped into one document
#[derive(Debug, Clone)]
pub(crate) struct RebuiltDocument {
    pub name: String,
    pub doc_id: String,
    current_line: usize,
    pub entries: Vec<CacheEntry>,
    pub full_text: String,
}

impl RebuiltDocument {
    fn new(name: String) -> Self {
        Self {
            name,
            doc_id: Uuid::new_v4().to_string(),
            current_line: 0,
            entries: Vec::new(),
            full_text: String::new(),
        }
    }

    /// Append a fragment, assigning it the next line range
    fn push(&mut self, record: VectorRecord) {
        let text = record.text().unwrap_or_default().to_string();
        let extra_lines = text.matches('\n').count();
        let from = self.current_line + 1;
        let to = from + extra_lines;

        let mut metadata = Metadata::new();
        metadata.insert("title".into(), Value::String(self.name.clone()));
        metadata.insert("loc.lines.from".into(), json!(from));
        metadata.insert("loc.lines.to".into(), json!(to));
        metadata.extend(record.metadata);
        metadata.remove(RUN_MARKER_KEY);
        metadata.insert("text".into(), Value::String(text.clone()));

        self.entries.push(CacheEntry {
            vector_db_id: record.id,
            values: record.values,
            metadata,
        });
        self.full_text.push_str(&text);
        self.current_line = to;
    }
}

/// Groups fetched vectors by `title`, then `name`, in discovery order
#[derive(Debug, Default)]
pub(crate) struct DocumentGroups {
    documents: Vec<RebuiltDocument>,
    by_name: HashMap<String, usize>,
}

impl DocumentGroups {
    pub fn add(&mut self, record: VectorRecord) {
        let name = document_name(&record.metadata);
        let index = match self.by_name.get(&name) {
            Some(index) => *index,
            None => {
                self.documents.push(RebuiltDocument::new(name.clone()));
                self.by_name.insert(name, self.documents.len() - 1);
                self.documents.len() - 1
            }
        };
        self.documents[index].push(record);
    }

    pub fn vector_count(&self) -> usize {
        self.documents.iter().map(|d| d.entries.len()).sum()
    }

    pub fn into_documents(self) -> Vec<RebuiltDocument> {
        self.documents
    }
}

fn document_name(metadata: &Metadata) -> String {
    ["title", "name"]
        .iter()
        .filter_map(|key| metadata.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("imported-document-{}.txt", Uuid::new_v4()))
}

// ============================================================================
// Engine
// ============================================================================

/// One-way import from a remote namespace into the ledger and cache
pub struct SyncEngine {
    ctx: JobContext,
}

impl SyncEngine {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Run the sync, notify the organization and record the job status
    pub async fn run(&self, payload: &SyncPayload) -> Result<SyncSummary> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.sync(payload).await;
        if let Err(e) = &outcome {
            if let Ok(Some(target)) = self.notification_target(payload.workspace_id).await {
                self.notify(&target, false).await;
            }
            tracing::warn!(workspace_id = payload.workspace_id, error = %e, "Sync failed");
        }

        reporter
            .finish(outcome, |(message, summary)| {
                JobReport::message(message.clone()).with_details(json!(summary))
            })
            .await
            .map(|(_, summary)| summary)
    }

    async fn sync(&self, payload: &SyncPayload) -> Result<(String, SyncSummary)> {
        let workspace = self.ctx.workspace(payload.workspace_id).await?;
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;
        let label = connector.kind().label();
        let namespace = connector.collection_name(&workspace.slug);

        let Some(info) = connector.namespace(&namespace).await? else {
            return Ok((
                format!("No {label} namespace found for {} - nothing to do.", workspace.slug),
                SyncSummary::default(),
            ));
        };
        if info.vector_count == 0 {
            return Ok((
                format!("{label} namespace {} has no data - nothing to do.", workspace.slug),
                SyncSummary::default(),
            ));
        }

        tracing::info!(
            namespace = %namespace,
            count = info.vector_count,
            organization = %organization.name,
            "Syncing namespace"
        );

        let (groups, pages) = paginate(connector.as_ref(), &namespace).await?;
        let summary = SyncSummary {
            documents: 0,
            vectors: groups.vector_count(),
            pages,
        };
        let documents = self.replace_local(&workspace, groups.into_documents()).await?;

        let kind = connector.kind();
        self.notify(&(organization, workspace, kind), true).await;

        Ok((
            format!("{label} instance vector data has been synced. Workspace updated."),
            SyncSummary {
                documents,
                ..summary
            },
        ))
    }

    /// Delete the workspace's local documents and cache files, then write
    /// the rebuilt ones. Returns the number of documents created.
    async fn replace_local(
        &self,
        workspace: &Workspace,
        documents: Vec<RebuiltDocument>,
    ) -> Result<usize> {
        let existing = self.ctx.ledger.documents_for_workspace(workspace.id).await?;
        for document in &existing {
            self.ctx
                .cache
                .delete(&VectorCacheStore::key_for(document))
                .await?;
        }
        self.ctx
            .ledger
            .delete_documents_for_workspace(workspace.id)
            .await?;
        tracing::info!(removed = existing.len(), "Removed existing workspace documents");

        let new_documents: Vec<NewDocument> = documents
            .iter()
            .map(|d| NewDocument {
                doc_id: d.doc_id.clone(),
                name: d.name.clone(),
                workspace_id: workspace.id,
                organization_id: workspace.organization_id,
            })
            .collect();
        self.ctx.ledger.create_documents(&new_documents).await?;

        let doc_ids: Vec<String> = documents.iter().map(|d| d.doc_id.clone()).collect();
        let created: HashMap<String, Document> = self
            .ctx
            .ledger
            .documents_by_doc_ids(&doc_ids)
            .await?
            .into_iter()
            .map(|d| (d.doc_id.clone(), d))
            .collect();

        let mut fragments = Vec::new();
        for document in &documents {
            let Some(row) = created.get(&document.doc_id) else {
                tracing::error!(doc_id = %document.doc_id, "Could not find the created document");
                continue;
            };
            fragments.extend(
                document
                    .entries
                    .iter()
                    .map(|e| NewDocumentVector::for_document(row, e.vector_db_id.clone())),
            );
        }
        self.ctx.ledger.create_document_vectors(&fragments).await?;

        for document in &documents {
            tracing::debug!(
                document = %document.name,
                fragments = document.entries.len(),
                characters = document.full_text.len(),
                "Creating vector cache"
            );
            self.ctx
                .cache
                .write(
                    &VectorCacheStore::cache_key(workspace.id, &document.name),
                    &document.entries,
                )
                .await?;
        }

        Ok(created.len())
    }

    async fn notification_target(
        &self,
        workspace_id: i64,
    ) -> Result<Option<NotificationTarget>> {
        let Some(workspace) = self.ctx.ledger.workspace(workspace_id).await? else {
            return Ok(None);
        };
        let organization = self.ctx.organization(workspace.organization_id).await?;
        let Some(config) = self.ctx.ledger.connector_for(organization.id).await? else {
            return Ok(None);
        };
        Ok(Some((organization, workspace, config.kind)))
    }

    async fn notify(&self, (organization, workspace, kind): &NotificationTarget, synced: bool) {
        let notification = if synced {
            Notification::new(format!(
                "Your {} namespace has been fully synced.",
                kind.label()
            ))
            .with_link(format!(
                "/dashboard/{}/workspace/{}",
                organization.slug, workspace.slug
            ))
        } else {
            Notification::new(format!("Your {} namespace failed to sync.", kind.label()))
                .with_link(format!("/dashboard/{}/jobs", organization.slug))
        }
        .with_symbol(kind.as_str());

        if let Err(e) = self.ctx.jobs.notify(organization.id, &notification).await {
            tracing::warn!(error = %e, "Failed to create sync notification");
        }
    }
}

/// Page through a namespace until a page brings nothing new.
///
/// Each page is tagged with the run marker before the next fetch; on
/// backends with a write delay the loop sleeps so the tags are visible.
pub(crate) async fn paginate(
    connector: &dyn VectorConnector,
    namespace: &str,
) -> Result<(DocumentGroups, usize)> {
    let mut cursor = PageCursor::new(connector.page_size());
    let mut seen: HashSet<String> = HashSet::new();
    let mut groups = DocumentGroups::default();

    loop {
        let page = connector.fetch_next_page(namespace, &mut cursor).await?;
        if page.is_empty() {
            break;
        }

        let fresh: Vec<VectorRecord> = page
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        if fresh.is_empty() {
            return Err(VdmError::VectorDbError(format!(
                "Pagination of {namespace} stalled: page {} returned only known vectors",
                cursor.pages
            )));
        }

        let ids: Vec<String> = fresh.iter().map(|r| r.id.clone()).collect();
        connector.mark_seen(namespace, &ids, &cursor).await?;
        tracing::debug!(namespace, page = cursor.pages, count = ids.len(), "Fetched page");

        for record in fresh {
            groups.add(record);
        }

        if let Some(delay) = connector.write_delay() {
            tracing::info!(?delay, "Constrained tier detected, waiting for tags to settle");
            tokio::time::sleep(delay).await;
        }
    }

    Ok((groups, cursor.pages))
}
