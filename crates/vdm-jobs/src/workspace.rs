//! Connector-aware workspace creation
//!
//! The slug doubles as the remote namespace name, so a new workspace must
//! be unique both in the ledger and in the organization's vector database.

use rand::Rng;
use vdm_core::{NewWorkspace, Result, VdmError, Workspace};

use crate::JobContext;

/// Lowercase ASCII, hyphen-separated slug of a display name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
    }

    slug
}

fn slug_seed() -> u32 {
    rand::thread_rng().gen_range(10_000_000..100_000_000)
}

/// Create a workspace and its remote namespace for an organization.
///
/// When the slug already exists locally or remotely an 8-digit random
/// suffix is appended.
pub async fn create_workspace(
    ctx: &JobContext,
    organization_id: i64,
    name: &str,
    dimensions: usize,
) -> Result<Workspace> {
    let mut slug = slugify(name);
    if slug.is_empty() {
        return Err(VdmError::ValidationError(
            "No workspace name provided".to_string(),
        ));
    }

    let organization = ctx.organization(organization_id).await?;
    let connector = ctx.connector(&organization).await?;

    let taken_locally = ctx
        .ledger
        .workspace_by_slug(organization.id, &slug)
        .await?
        .is_some();
    let taken_remotely = connector
        .namespace(&connector.collection_name(&slug))
        .await?
        .is_some();

    if taken_locally || taken_remotely {
        let candidate = slugify(&format!("{name}-{}", slug_seed()));
        tracing::info!(slug = %slug, candidate = %candidate, "Workspace slug collision");
        slug = candidate;
    }

    connector
        .create_namespace(&connector.collection_name(&slug), dimensions)
        .await?;

    let workspace = ctx
        .ledger
        .create_workspace(&NewWorkspace {
            name: name.to_string(),
            slug,
            organization_id: organization.id,
        })
        .await?;

    tracing::info!(
        workspace = %workspace.slug,
        organization = %organization.name,
        backend = %connector.kind(),
        "Workspace created"
    );
    Ok(workspace)
}
