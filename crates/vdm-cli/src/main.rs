//! VDM CLI - Runs vector database jobs from the command line
//!
//! Usage:
//!   vdm migrate <organization> <destination>
//!   vdm sync <workspace>
//!   vdm update-embedding <fragment> <text>
//!   vdm update-metadata <fragment> <json>
//!   vdm delete-fragment <fragment>
//!   vdm delete-document <document>
//!   vdm create-workspace <organization> <name>
//!   vdm clone-workspace <workspace> <name>
//!   vdm clone-document <document> <workspace>
//!   vdm delete-workspace <workspace>
//!   vdm reset-organization <organization>
//!   vdm stats <organization>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use vdm_core::{AppConfig, JobId, JobStore, LedgerRepository, LedgerStore, LoggingConfig};
use vdm_jobs::{
    create_workspace, BackendResolver, CloneDocumentPayload, CloneWorkspacePayload,
    ConnectorResolver, DeleteDocumentPayload, DeleteFragmentPayload, DeleteWorkspacePayload,
    DocumentCloneJob, DocumentDeleteJob, EmbeddingUpdateEngine, FragmentDeleteJob, JobContext,
    MetadataUpdate, MetadataUpdateJob, MigrationEngine, MigrationPayload, OrganizationResetJob,
    ResetOrganizationPayload, SyncEngine, SyncPayload, UpdateEmbeddingPayload,
    UpdateMetadataPayload, WorkspaceCloneJob, WorkspaceDeleteJob,
};
use vdm_vector::{create_embedding_client, Metadata, VectorCacheStore};

#[derive(Parser)]
#[command(name = "vdm")]
#[command(about = "Vector database migration and maintenance CLI")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Existing job row to report to; a new one is queued when omitted
    #[arg(long, global = true)]
    job_id: Option<JobId>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an organization's vectors to another organization's database
    Migrate {
        organization_id: i64,
        destination_organization_id: i64,
    },
    /// Rebuild a workspace from its remote namespace
    Sync { workspace_id: i64 },
    /// Re-embed one fragment with new text
    UpdateEmbedding {
        document_vector_id: i64,
        new_text: String,
    },
    /// Replace one fragment's metadata with a JSON object
    UpdateMetadata {
        document_vector_id: i64,
        #[arg(value_parser = parse_metadata)]
        new_metadata: Metadata,
    },
    /// Delete one fragment everywhere
    DeleteFragment { document_vector_id: i64 },
    /// Delete a document and all of its fragments
    DeleteDocument { document_id: i64 },
    /// Create a workspace and its remote namespace
    CreateWorkspace {
        organization_id: i64,
        name: String,
        #[arg(long, default_value_t = 1536)]
        dimensions: usize,
    },
    /// Copy a workspace under a new name
    CloneWorkspace {
        workspace_id: i64,
        new_workspace_name: String,
    },
    /// Copy a document into another workspace
    CloneDocument {
        document_id: i64,
        destination_workspace_id: i64,
    },
    /// Delete a workspace, its namespace and its documents
    DeleteWorkspace { workspace_id: i64 },
    /// Empty an organization's vector database and drop its workspaces
    ResetOrganization { organization_id: i64 },
    /// Show index totals for an organization's database
    Stats { organization_id: i64 },
}

fn parse_metadata(raw: &str) -> Result<Metadata, String> {
    serde_json::from_str(raw).map_err(|e| format!("metadata must be a JSON object: {e}"))
}

impl Commands {
    fn task_name(&self) -> &'static str {
        match self {
            Commands::Migrate { .. } => "migrate-vectors",
            Commands::Sync { .. } => "sync-vector-namespace",
            Commands::UpdateEmbedding { .. } => "update-embedding",
            Commands::UpdateMetadata { .. } => "update-embedding-metadata",
            Commands::DeleteFragment { .. } => "delete-document-vector",
            Commands::DeleteDocument { .. } => "delete-document",
            Commands::CreateWorkspace { .. } => "create-workspace",
            Commands::CloneWorkspace { .. } => "clone-workspace",
            Commands::CloneDocument { .. } => "clone-document",
            Commands::DeleteWorkspace { .. } => "delete-workspace",
            Commands::ResetOrganization { .. } => "reset-organization",
            Commands::Stats { .. } => "stats",
        }
    }

    fn task_data(&self) -> serde_json::Value {
        match self {
            Commands::Migrate {
                organization_id,
                destination_organization_id,
            } => json!({
                "organizationId": organization_id,
                "destinationOrganizationId": destination_organization_id,
            }),
            Commands::Sync { workspace_id } => json!({ "workspaceId": workspace_id }),
            Commands::UpdateEmbedding {
                document_vector_id,
                new_text,
            } => json!({ "documentVectorId": document_vector_id, "newText": new_text }),
            Commands::UpdateMetadata {
                document_vector_id,
                new_metadata,
            } => json!({ "documentVectorId": document_vector_id, "newMetadata": new_metadata }),
            Commands::DeleteFragment { document_vector_id } => {
                json!({ "documentVectorId": document_vector_id })
            }
            Commands::DeleteDocument { document_id } => json!({ "documentId": document_id }),
            Commands::CloneWorkspace {
                workspace_id,
                new_workspace_name,
            } => json!({ "workspaceId": workspace_id, "newWorkspaceName": new_workspace_name }),
            Commands::CloneDocument {
                document_id,
                destination_workspace_id,
            } => json!({
                "documentId": document_id,
                "destinationWorkspaceId": destination_workspace_id,
            }),
            Commands::DeleteWorkspace { workspace_id } => json!({ "workspaceId": workspace_id }),
            Commands::ResetOrganization { organization_id } => {
                json!({ "organizationId": organization_id })
            }
            Commands::CreateWorkspace { .. } | Commands::Stats { .. } => json!({}),
        }
    }

    fn is_job(&self) -> bool {
        !matches!(
            self,
            Commands::CreateWorkspace { .. } | Commands::Stats { .. }
        )
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

/// Directives applied when `RUST_LOG` is unset; covers every vdm crate
fn default_directives(level: &str) -> String {
    ["vdm", "vdm_core", "vdm_vector", "vdm_jobs"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&logging.level)));

    if logging.json_format {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    let ledger = LedgerStore::new(&config.database.postgres_url, config.database.pool_size)
        .await
        .context("failed to connect to the ledger database")?;
    ledger.migrate().await?;

    let job_store = JobStore::new(ledger.pool().clone());
    let job_id = match cli.job_id {
        Some(id) => id,
        None if cli.command.is_job() => {
            job_store
                .enqueue(cli.command.task_name(), &cli.command.task_data())
                .await?
        }
        None => 0,
    };

    let resolver = Arc::new(BackendResolver::new(config.jobs.clone()));
    let ledger = Arc::new(ledger);
    let ctx = JobContext::new(
        ledger.clone(),
        Arc::new(job_store),
        Arc::new(VectorCacheStore::from_config(&config.cache)),
        resolver.clone(),
    );

    tracing::info!(task = cli.command.task_name(), job_id, "Starting");

    match cli.command {
        Commands::Migrate {
            organization_id,
            destination_organization_id,
        } => {
            let summary = MigrationEngine::new(ctx)
                .run(&MigrationPayload {
                    organization_id,
                    destination_organization_id,
                    job_id,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Sync { workspace_id } => {
            let summary = SyncEngine::new(ctx)
                .run(&SyncPayload {
                    workspace_id,
                    job_id,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::UpdateEmbedding {
            document_vector_id,
            new_text,
        } => {
            let embedder = Arc::from(create_embedding_client(&config.embedding)?);
            let update = EmbeddingUpdateEngine::new(ctx, embedder)
                .run(&UpdateEmbeddingPayload {
                    document_vector_id,
                    new_text,
                    job_id,
                })
                .await?;
            println!(
                "Document {} with vector {} updated",
                update.document_id, update.vector_id
            );
        }
        Commands::UpdateMetadata {
            document_vector_id,
            new_metadata,
        } => {
            let update = MetadataUpdateJob::new(ctx)
                .run(&UpdateMetadataPayload {
                    document_vector_id,
                    new_metadata,
                    job_id,
                })
                .await?;
            match update {
                MetadataUpdate::Applied { vector_id, .. } => {
                    println!("Vector {vector_id} metadata replaced")
                }
                MetadataUpdate::Unsupported { backend } => {
                    println!("{backend} does not support metadata updates, nothing was done")
                }
            }
        }
        Commands::DeleteFragment { document_vector_id } => {
            let vector_id = FragmentDeleteJob::new(ctx)
                .run(&DeleteFragmentPayload {
                    document_vector_id,
                    job_id,
                })
                .await?;
            println!("Vector {vector_id} deleted");
        }
        Commands::DeleteDocument { document_id } => {
            let removed = DocumentDeleteJob::new(ctx)
                .run(&DeleteDocumentPayload {
                    document_id,
                    job_id,
                })
                .await?;
            println!("Document {document_id} deleted with {removed} vectors");
        }
        Commands::CreateWorkspace {
            organization_id,
            name,
            dimensions,
        } => {
            let workspace = create_workspace(&ctx, organization_id, &name, dimensions).await?;
            println!("Workspace {} created as {}", workspace.id, workspace.slug);
        }
        Commands::CloneWorkspace {
            workspace_id,
            new_workspace_name,
        } => {
            let clone = WorkspaceCloneJob::new(ctx)
                .run(&CloneWorkspacePayload {
                    workspace_id,
                    new_workspace_name,
                    job_id,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&clone)?);
        }
        Commands::CloneDocument {
            document_id,
            destination_workspace_id,
        } => {
            let clone = DocumentCloneJob::new(ctx)
                .run(&CloneDocumentPayload {
                    document_id,
                    destination_workspace_id,
                    job_id,
                })
                .await?;
            println!(
                "Document {} cloned into {} with {} vectors",
                clone.document.id, clone.destination.slug, clone.vectors
            );
        }
        Commands::DeleteWorkspace { workspace_id } => {
            let deletion = WorkspaceDeleteJob::new(ctx)
                .run(&DeleteWorkspacePayload {
                    workspace_id,
                    job_id,
                })
                .await?;
            println!(
                "Workspace {} deleted with {} documents",
                deletion.workspace.slug, deletion.documents
            );
        }
        Commands::ResetOrganization { organization_id } => {
            let reset = OrganizationResetJob::new(ctx)
                .run(&ResetOrganizationPayload {
                    organization_id,
                    job_id,
                })
                .await?;
            println!(
                "{} reset: {} namespaces and {} workspaces removed",
                reset.backend, reset.namespaces, reset.workspaces
            );
        }
        Commands::Stats { organization_id } => {
            let organization = ledger
                .organization(organization_id)
                .await?
                .with_context(|| format!("organization {organization_id} not found"))?;
            let connector_config = ledger
                .connector_for(organization.id)
                .await?
                .with_context(|| format!("{} has no vector database", organization.name))?;

            let connector = resolver.resolve(&connector_config)?;
            connector.connect().await?;
            println!(
                "{} ({}): {} vectors",
                organization.name,
                connector.kind().label(),
                connector.total_indices().await?
            );
            for namespace in connector.namespaces().await? {
                println!("  {:<40} {}", namespace.name, namespace.vector_count);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cover_library_crates() {
        let directives = default_directives("debug");
        for target in ["vdm=debug", "vdm_core=debug", "vdm_vector=debug", "vdm_jobs=debug"] {
            assert!(directives.split(',').any(|d| d == target), "missing {target}");
        }
    }

    #[test]
    fn test_metadata_argument_must_be_an_object() {
        assert!(parse_metadata(r#"{"title":"a.txt"}"#).is_ok());
        assert!(parse_metadata("[1, 2]").is_err());
    }
}
