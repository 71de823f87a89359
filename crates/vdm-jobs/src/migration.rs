//! Migration engine
//!
//! Copies every cached vector of one organization into the vector database
//! of another, possibly of a different backend type. Embeddings are never
//! recomputed: values and metadata come from the vector cache, while docIds
//! and vector ids are minted fresh for the destination.
//!
//! Re-running a migration is safe. Namespaces already present in the
//! destination are skipped, so a second run copies nothing new.
//!
//! Author: hephaex@gmail.com

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use vdm_core::{
    Document, JobReport, NewDocument, NewDocumentVector, NewWorkspace, Organization, Result,
    VdmError, Workspace,
};
use vdm_vector::{CacheEntry, VectorCacheStore, VectorConnector, VectorRecord, UPSERT_CHUNK_SIZE};

use crate::{aborts_job, JobContext, JobReporter, MigrationPayload};

/// Dimensions used for a destination namespace when no cache is readable
const FALLBACK_DIMENSIONS: usize = 3072;

/// Display name of the workspace standing for a backend's default namespace
const DEFAULT_NAMESPACE_NAME: &str = "(default)";

/// Outcome of a completed migration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub migrated_documents: usize,
    pub migrated_vectors: usize,
    pub skipped_namespaces: Vec<String>,
    pub skipped_documents: Vec<String>,
}

/// Cross-organization, cross-backend bulk copy
pub struct MigrationEngine {
    ctx: JobContext,
}

impl MigrationEngine {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Run the migration and record its terminal status
    pub async fn run(&self, payload: &MigrationPayload) -> Result<MigrationSummary> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.migrate(payload, &reporter).await;
        reporter
            .finish(outcome, |(source, destination, summary)| {
                JobReport::message(format!(
                    "Organization {} vectors migrated to {}.",
                    source.name, destination.name
                ))
                .with_details(json!(summary))
            })
            .await
            .map(|(_, _, summary)| summary)
    }

    async fn migrate(
        &self,
        payload: &MigrationPayload,
        reporter: &JobReporter,
    ) -> Result<(Organization, Organization, MigrationSummary)> {
        let source = self.ctx.organization(payload.organization_id).await?;
        let destination = self
            .ctx
            .organization(payload.destination_organization_id)
            .await?;

        // Both sides must be connected before anything is written
        let source_config = self.ctx.connector_config(&source).await?;
        let target = self.ctx.connector(&destination).await?;

        tracing::info!(
            source = %source.name,
            from = %source_config.kind,
            destination = %destination.name,
            to = %target.kind(),
            "Starting organization migration"
        );

        let workspaces = self.ctx.ledger.workspaces_for(source.id).await?;
        let total = workspaces.len();
        let mut summary = MigrationSummary::default();

        for (index, workspace) in workspaces.iter().enumerate() {
            reporter
                .progress(format!("Working on namespace {} of {total}", index + 1))
                .await;

            match self
                .migrate_workspace(target.as_ref(), workspace, &destination, &mut summary)
                .await
            {
                Ok(true) => {}
                Ok(false) => summary.skipped_namespaces.push(workspace.slug.clone()),
                Err(e) if aborts_job(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(workspace = %workspace.slug, error = %e, "Skipping workspace");
                    summary.skipped_namespaces.push(workspace.slug.clone());
                }
            }
        }

        tracing::info!(
            documents = summary.migrated_documents,
            vectors = summary.migrated_vectors,
            skipped = summary.skipped_namespaces.len(),
            "Organization migration finished"
        );
        Ok((source, destination, summary))
    }

    /// Returns `false` when the workspace was skipped
    async fn migrate_workspace(
        &self,
        target: &dyn VectorConnector,
        workspace: &Workspace,
        destination: &Organization,
        summary: &mut MigrationSummary,
    ) -> Result<bool> {
        let documents = self.ctx.ledger.documents_for_workspace(workspace.id).await?;
        let mut cached = Vec::with_capacity(documents.len());
        for document in documents {
            match self.cached_entries(&document).await {
                Ok(entries) => cached.push((document, entries)),
                Err(e) if aborts_job(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        document = %document.name,
                        error = %e,
                        "No usable vector cache, skipping document"
                    );
                    summary.skipped_documents.push(document.name.clone());
                }
            }
        }

        let dimensions = cached
            .iter()
            .flat_map(|(_, entries)| entries.first())
            .map(|entry| entry.values.len())
            .next()
            .unwrap_or(FALLBACK_DIMENSIONS);

        let Some(migrated) = self
            .destination_workspace(target, workspace, destination, dimensions)
            .await?
        else {
            return Ok(false);
        };

        let namespace = target.collection_name(&migrated.slug);
        tracing::info!(
            documents = cached.len(),
            workspace = %migrated.slug,
            organization = %destination.name,
            "Migrating documents"
        );

        for (document, entries) in cached {
            match self
                .migrate_document(target, &namespace, &migrated, &document, entries)
                .await
            {
                Ok(vectors) => {
                    summary.migrated_documents += 1;
                    summary.migrated_vectors += vectors;
                }
                Err(e) if aborts_job(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        document = %document.name,
                        error = %e,
                        "Failed to migrate document"
                    );
                    summary.skipped_documents.push(document.name.clone());
                }
            }
        }

        Ok(true)
    }

    async fn cached_entries(&self, document: &Document) -> Result<Vec<CacheEntry>> {
        self.ctx
            .cache
            .read_required(&VectorCacheStore::key_for(document))
            .await
    }

    /// Materialize the destination namespace and its workspace record.
    ///
    /// `None` when the namespace already exists in the destination or the
    /// destination tier cannot hold it.
    async fn destination_workspace(
        &self,
        target: &dyn VectorConnector,
        workspace: &Workspace,
        destination: &Organization,
        dimensions: usize,
    ) -> Result<Option<Workspace>> {
        if !target.supports_namespace(&workspace.slug) {
            tracing::info!(
                namespace = %workspace.slug,
                "Destination tier does not support named namespaces, skipping"
            );
            return Ok(None);
        }

        let already_recorded = self
            .ctx
            .ledger
            .workspace_by_slug(destination.id, &workspace.slug)
            .await?
            .is_some();
        if already_recorded {
            return Ok(None);
        }

        // Only backends with an implicit default namespace can receive the
        // unnamed one; the ledger record decides whether it was migrated.
        let name = if workspace.slug.is_empty() {
            if !target.has_default_namespace() {
                tracing::info!(
                    to = %target.kind(),
                    "Destination has no default namespace, skipping"
                );
                return Ok(None);
            }
            DEFAULT_NAMESPACE_NAME.to_string()
        } else {
            let namespace = target.collection_name(&workspace.slug);
            if target.namespace_exists(&namespace).await? {
                tracing::info!(namespace = %namespace, "Namespace exists in destination, skipping");
                return Ok(None);
            }
            target.create_namespace(&namespace, dimensions).await?;
            workspace.name.clone()
        };

        self.ctx
            .ledger
            .create_workspace(&NewWorkspace {
                name,
                slug: workspace.slug.clone(),
                organization_id: destination.id,
            })
            .await
            .map(Some)
    }

    /// Copy one document; returns the number of vectors written
    async fn migrate_document(
        &self,
        target: &dyn VectorConnector,
        namespace: &str,
        workspace: &Workspace,
        document: &Document,
        entries: Vec<CacheEntry>,
    ) -> Result<usize> {
        copy_document(&self.ctx, target, namespace, workspace, &document.name, entries)
            .await
            .map(|(_, vectors)| vectors)
    }
}

/// Write re-keyed vectors into `namespace`, then record the document, its
/// fragments and its cache file under `workspace`.
///
/// All chunks must land. On a partial failure the chunks that did land are
/// removed again and nothing is recorded.
pub(crate) async fn copy_document(
    ctx: &JobContext,
    target: &dyn VectorConnector,
    namespace: &str,
    workspace: &Workspace,
    name: &str,
    entries: Vec<CacheEntry>,
) -> Result<(Document, usize)> {
    let records = rekey(entries);
    tracing::debug!(
        count = records.len(),
        backend = %target.kind(),
        "Inserting vectors"
    );
    let outcome = target.add_vectors(namespace, &records).await?;
    if !outcome.success() {
        let failed: HashSet<&str> = outcome.failed_ids().collect();
        let landed: Vec<String> = records
            .iter()
            .filter(|r| !failed.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();
        if let Err(e) = target.delete_ids(namespace, &landed).await {
            tracing::warn!(document = name, error = %e, "Failed to remove partially written vectors");
        }
        return Err(VdmError::VectorDbError(format!(
            "{} of {} vector chunks were rejected for {name}",
            outcome.errors.len(),
            records.len().div_ceil(UPSERT_CHUNK_SIZE)
        )));
    }

    let created = ctx
        .ledger
        .create_document(&NewDocument::minted(name.to_string(), workspace))
        .await?;

    match record_copy(ctx, &created, records).await {
        Ok(vectors) => Ok((created, vectors)),
        Err(e) => {
            if let Err(cleanup) = ctx.ledger.delete_document(created.id).await {
                tracing::warn!(document = name, error = %cleanup, "Failed to remove copied document");
            }
            Err(e)
        }
    }
}

async fn record_copy(
    ctx: &JobContext,
    created: &Document,
    records: Vec<VectorRecord>,
) -> Result<usize> {
    let fragments: Vec<NewDocumentVector> = records
        .iter()
        .map(|r| NewDocumentVector::for_document(created, r.id.clone()))
        .collect();
    ctx.ledger.create_document_vectors(&fragments).await?;

    let cache_entries: Vec<CacheEntry> = records.into_iter().map(CacheEntry::from).collect();
    ctx.cache
        .write(&VectorCacheStore::key_for(created), &cache_entries)
        .await?;
    Ok(cache_entries.len())
}

/// Fresh vector ids for a destination, keeping values and metadata
pub(crate) fn rekey(entries: Vec<CacheEntry>) -> Vec<VectorRecord> {
    entries
        .into_iter()
        .map(|entry| {
            VectorRecord::new(Uuid::new_v4().to_string(), entry.values, entry.metadata)
        })
        .collect()
}
