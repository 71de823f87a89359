//! PostgreSQL document/vector ledger
//!
//! Relational records for workspaces, documents, fragments and connectors
//! using SQLx and PostgreSQL.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;

use crate::{
    ConnectorConfig, Document, DocumentVector, NewDocument, NewDocumentVector, NewWorkspace,
    Organization, Result, VdmError, Workspace,
};

/// Trait for ledger operations consumed by the engines
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Get organization by ID
    async fn organization(&self, id: i64) -> Result<Option<Organization>>;

    /// Get the connector bound to an organization
    async fn connector_for(&self, organization_id: i64) -> Result<Option<ConnectorConfig>>;

    /// List workspaces of an organization
    async fn workspaces_for(&self, organization_id: i64) -> Result<Vec<Workspace>>;

    /// Get workspace by ID
    async fn workspace(&self, id: i64) -> Result<Option<Workspace>>;

    /// Find an organization's workspace by slug
    async fn workspace_by_slug(&self, organization_id: i64, slug: &str)
        -> Result<Option<Workspace>>;

    /// Create a workspace
    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<Workspace>;

    /// Delete a workspace (cascades to documents and fragments)
    async fn delete_workspace(&self, id: i64) -> Result<()>;

    /// Get document by ID
    async fn document(&self, id: i64) -> Result<Option<Document>>;

    /// List documents of a workspace
    async fn documents_for_workspace(&self, workspace_id: i64) -> Result<Vec<Document>>;

    /// Find documents by their external ids
    async fn documents_by_doc_ids(&self, doc_ids: &[String]) -> Result<Vec<Document>>;

    /// Create a single document
    async fn create_document(&self, document: &NewDocument) -> Result<Document>;

    /// Bulk create documents in one transaction, returns rows inserted
    async fn create_documents(&self, documents: &[NewDocument]) -> Result<u64>;

    /// Delete a document (cascades to fragments)
    async fn delete_document(&self, id: i64) -> Result<()>;

    /// Delete every document of a workspace, returns rows removed
    async fn delete_documents_for_workspace(&self, workspace_id: i64) -> Result<u64>;

    /// Get fragment by ID
    async fn document_vector(&self, id: i64) -> Result<Option<DocumentVector>>;

    /// List fragments of a document
    async fn vectors_for_document(&self, document_id: i64) -> Result<Vec<DocumentVector>>;

    /// Bulk create fragment rows in one transaction, returns rows inserted
    async fn create_document_vectors(&self, vectors: &[NewDocumentVector]) -> Result<u64>;

    /// Count fragments of a workspace
    async fn count_document_vectors(&self, workspace_id: i64) -> Result<u64>;

    /// Delete one fragment row
    async fn delete_document_vector(&self, id: i64) -> Result<()>;
}

/// PostgreSQL ledger store
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    /// Create a new ledger connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| VdmError::DatabaseError(format!("PostgreSQL connection failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| VdmError::DatabaseError(format!("Migration failed: {e}")))
    }
}

fn db_err(action: &str) -> impl FnOnce(sqlx::Error) -> VdmError + '_ {
    move |e| VdmError::DatabaseError(format!("Failed to {action}: {e}"))
}

/// Connector row from database
#[derive(Debug, FromRow)]
struct ConnectorRow {
    id: i64,
    organization_id: i64,
    kind: String,
    settings: serde_json::Value,
}

impl TryFrom<ConnectorRow> for ConnectorConfig {
    type Error = VdmError;

    fn try_from(row: ConnectorRow) -> Result<Self> {
        Ok(ConnectorConfig {
            id: row.id,
            organization_id: row.organization_id,
            kind: row.kind.parse()?,
            settings: row.settings,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    id: i64,
    name: String,
    slug: String,
}

#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: i64,
    name: String,
    slug: String,
    organization_id: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: row.id,
            name: row.name,
            slug: row.slug,
            organization_id: row.organization_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: i64,
    doc_id: String,
    name: String,
    workspace_id: i64,
    organization_id: i64,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            doc_id: row.doc_id,
            name: row.name,
            workspace_id: row.workspace_id,
            organization_id: row.organization_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct VectorRow {
    id: i64,
    doc_id: String,
    vector_id: String,
    document_id: i64,
    workspace_id: i64,
    organization_id: i64,
}

impl From<VectorRow> for DocumentVector {
    fn from(row: VectorRow) -> Self {
        DocumentVector {
            id: row.id,
            doc_id: row.doc_id,
            vector_id: row.vector_id,
            document_id: row.document_id,
            workspace_id: row.workspace_id,
            organization_id: row.organization_id,
        }
    }
}

const DOCUMENT_COLUMNS: &str = "id, doc_id, name, workspace_id, organization_id";
const VECTOR_COLUMNS: &str = "id, doc_id, vector_id, document_id, workspace_id, organization_id";

#[async_trait]
impl LedgerRepository for LedgerStore {
    async fn organization(&self, id: i64) -> Result<Option<Organization>> {
        let row: Option<OrganizationRow> =
            sqlx::query_as("SELECT id, name, slug FROM organizations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("get organization"))?;

        Ok(row.map(|r| Organization {
            id: r.id,
            name: r.name,
            slug: r.slug,
        }))
    }

    async fn connector_for(&self, organization_id: i64) -> Result<Option<ConnectorConfig>> {
        let row: Option<ConnectorRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, type AS kind, settings
            FROM organization_connections
            WHERE organization_id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get connector"))?;

        row.map(ConnectorConfig::try_from).transpose()
    }

    async fn workspaces_for(&self, organization_id: i64) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(
            r#"
            SELECT id, name, slug, organization_id
            FROM organization_workspaces
            WHERE organization_id = $1
            ORDER BY id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list workspaces"))?;

        Ok(rows.into_iter().map(Workspace::from).collect())
    }

    async fn workspace(&self, id: i64) -> Result<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(
            "SELECT id, name, slug, organization_id FROM organization_workspaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get workspace"))?;

        Ok(row.map(Workspace::from))
    }

    async fn workspace_by_slug(
        &self,
        organization_id: i64,
        slug: &str,
    ) -> Result<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(
            r#"
            SELECT id, name, slug, organization_id
            FROM organization_workspaces
            WHERE organization_id = $1 AND slug = $2
            "#,
        )
        .bind(organization_id)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get workspace by slug"))?;

        Ok(row.map(Workspace::from))
    }

    async fn create_workspace(&self, workspace: &NewWorkspace) -> Result<Workspace> {
        let row: WorkspaceRow = sqlx::query_as(
            r#"
            INSERT INTO organization_workspaces (name, slug, organization_id)
            VALUES ($1, $2, $3)
            RETURNING id, name, slug, organization_id
            "#,
        )
        .bind(&workspace.name)
        .bind(&workspace.slug)
        .bind(workspace.organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("create workspace"))?;

        Ok(row.into())
    }

    async fn delete_workspace(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM organization_workspaces WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete workspace"))?;

        Ok(())
    }

    async fn document(&self, id: i64) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM workspace_documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get document"))?;

        Ok(row.map(Document::from))
    }

    async fn documents_for_workspace(&self, workspace_id: i64) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM workspace_documents WHERE workspace_id = $1 ORDER BY id"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list documents"))?;

        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn documents_by_doc_ids(&self, doc_ids: &[String]) -> Result<Vec<Document>> {
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM workspace_documents WHERE doc_id = ANY($1)"
        ))
        .bind(doc_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("find documents by docId"))?;

        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn create_document(&self, document: &NewDocument) -> Result<Document> {
        let row: DocumentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO workspace_documents (doc_id, name, workspace_id, organization_id)
            VALUES ($1, $2, $3, $4)
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(&document.doc_id)
        .bind(&document.name)
        .bind(document.workspace_id)
        .bind(document.organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("create document"))?;

        Ok(row.into())
    }

    async fn create_documents(&self, documents: &[NewDocument]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let mut inserted = 0;

        for document in documents {
            let result = sqlx::query(
                r#"
                INSERT INTO workspace_documents (doc_id, name, workspace_id, organization_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&document.doc_id)
            .bind(&document.name)
            .bind(document.workspace_id)
            .bind(document.organization_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("create documents"))?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(db_err("commit documents"))?;
        Ok(inserted)
    }

    async fn delete_document(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM workspace_documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete document"))?;

        Ok(())
    }

    async fn delete_documents_for_workspace(&self, workspace_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workspace_documents WHERE workspace_id = $1")
            .bind(workspace_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete workspace documents"))?;

        Ok(result.rows_affected())
    }

    async fn document_vector(&self, id: i64) -> Result<Option<DocumentVector>> {
        let row: Option<VectorRow> = sqlx::query_as(&format!(
            "SELECT {VECTOR_COLUMNS} FROM document_vectors WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get document vector"))?;

        Ok(row.map(DocumentVector::from))
    }

    async fn vectors_for_document(&self, document_id: i64) -> Result<Vec<DocumentVector>> {
        let rows: Vec<VectorRow> = sqlx::query_as(&format!(
            "SELECT {VECTOR_COLUMNS} FROM document_vectors WHERE document_id = $1 ORDER BY id"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list document vectors"))?;

        Ok(rows.into_iter().map(DocumentVector::from).collect())
    }

    async fn create_document_vectors(&self, vectors: &[NewDocumentVector]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let mut inserted = 0;

        for vector in vectors {
            let result = sqlx::query(
                r#"
                INSERT INTO document_vectors (
                    doc_id, vector_id, document_id, workspace_id, organization_id
                ) VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&vector.doc_id)
            .bind(&vector.vector_id)
            .bind(vector.document_id)
            .bind(vector.workspace_id)
            .bind(vector.organization_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("create document vectors"))?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(db_err("commit document vectors"))?;
        Ok(inserted)
    }

    async fn count_document_vectors(&self, workspace_id: i64) -> Result<u64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM document_vectors WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err("count document vectors"))?;

        Ok(row.0.max(0) as u64)
    }

    async fn delete_document_vector(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM document_vectors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete document vector"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_row_conversion() {
        let row = ConnectorRow {
            id: 1,
            organization_id: 4,
            kind: "pinecone".to_string(),
            settings: serde_json::json!({ "index": "main" }),
        };
        let config = ConnectorConfig::try_from(row).unwrap();
        assert_eq!(config.kind, crate::ConnectorType::Pinecone);
        assert_eq!(config.organization_id, 4);
    }

    #[test]
    fn test_unknown_connector_row_is_rejected() {
        let row = ConnectorRow {
            id: 1,
            organization_id: 4,
            kind: "faiss".to_string(),
            settings: serde_json::Value::Null,
        };
        assert!(ConnectorConfig::try_from(row).is_err());
    }
}
