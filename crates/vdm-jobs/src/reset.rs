//! Organization reset job
//!
//! Empties an organization's vector database and forgets every workspace
//! it had. Tiers that cannot drop namespaces are emptied by deleting the
//! vector ids the ledger knows about.

use serde_json::json;
use vdm_core::{JobReport, Result};

use crate::workspace_delete::{delete_in_chunks, ledger_vector_ids, purge_local};
use crate::{JobContext, ResetOrganizationPayload};

/// Outcome of an organization reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationReset {
    pub backend: &'static str,
    pub namespaces: usize,
    pub workspaces: usize,
}

pub struct OrganizationResetJob {
    ctx: JobContext,
}

impl OrganizationResetJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, payload: &ResetOrganizationPayload) -> Result<OrganizationReset> {
        let reporter = self.ctx.reporter(payload.job_id);

        let outcome = self.reset(payload.organization_id).await;
        reporter
            .finish(outcome, |reset| {
                JobReport::message(format!(
                    "All namespaces and vectors deleted from {}.",
                    reset.backend
                ))
                .with_details(json!({
                    "namespaces": reset.namespaces,
                    "workspaces": reset.workspaces,
                }))
            })
            .await
    }

    async fn reset(&self, organization_id: i64) -> Result<OrganizationReset> {
        let organization = self.ctx.organization(organization_id).await?;
        let connector = self.ctx.connector(&organization).await?;
        let workspaces = self.ctx.ledger.workspaces_for(organization.id).await?;

        let namespaces = if connector.can_drop_namespaces() {
            let remote = connector.namespaces().await?;
            for namespace in &remote {
                connector.delete_namespace(&namespace.name).await?;
                tracing::debug!(namespace = %namespace.name, "Namespace dropped");
            }
            remote.len()
        } else {
            for workspace in &workspaces {
                let ids = ledger_vector_ids(&self.ctx, workspace).await?;
                let namespace = connector.collection_name(&workspace.slug);
                delete_in_chunks(connector.as_ref(), &namespace, &ids).await?;
            }
            workspaces.len()
        };

        for workspace in &workspaces {
            purge_local(&self.ctx, workspace).await?;
        }

        tracing::info!(
            organization = %organization.name,
            namespaces,
            workspaces = workspaces.len(),
            "Organization reset"
        );
        Ok(OrganizationReset {
            backend: connector.kind().label(),
            namespaces,
            workspaces: workspaces.len(),
        })
    }
}
