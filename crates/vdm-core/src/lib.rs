//! VDM Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the VDM system:
//! - Organization, workspace, document and fragment records
//! - Connector configuration for the supported vector databases
//! - Common error types
//! - Ledger traits (documents/vectors and job status)
//! - Configuration management
//! - Token budget validation for embedding input

pub mod config;
pub mod jobs;
pub mod ledger;
pub mod tokens;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use config::{
    AppConfig, CacheConfig, ConfigError, DatabaseConfig, EmbeddingConfig, EmbeddingProvider,
    JobsConfig, LoggingConfig,
};
pub use jobs::{JobId, JobLedger, JobReport, JobStatus, JobStore, Notification};
pub use ledger::{LedgerRepository, LedgerStore};
pub use tokens::{validate_embedding_text, TokenEstimate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for VDM operations
#[derive(Error, Debug)]
pub enum VdmError {
    /// Backend unreachable or misconfigured
    #[error("Connection error: {message}")]
    ConnectionError { message: String, transient: bool },

    #[error("Missing connector: {0}")]
    MissingConnector(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("Vector cache file missing: {0}")]
    CacheMissing(String),

    #[error("Vector cache error: {0}")]
    CacheError(String),

    /// A remote vector database rejected or failed an operation
    #[error("Vector database error: {0}")]
    VectorDbError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VdmError {
    /// Backend could not be reached; retrying later may succeed
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            transient: true,
        }
    }

    /// Connector settings are unusable; retrying will not help
    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether re-triggering the same job could succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { transient, .. } => *transient,
            Self::EmbeddingError(_) | Self::VectorDbError(_) | Self::DatabaseError(_) => true,
            Self::CacheError(_) | Self::Other(_) => true,
            Self::MissingConnector(_)
            | Self::NotFound(_)
            | Self::ValidationError(_)
            | Self::CacheMissing(_)
            | Self::ConfigError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VdmError>;

// ============================================================================
// Organizations and Workspaces
// ============================================================================

/// Tenant owning workspaces and exactly one connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

/// One namespace/collection/class in exactly one remote vector database.
///
/// The slug doubles as the remote namespace name; adapters derive their own
/// identifier from it where the backend imposes naming rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub organization_id: i64,
}

/// Insert payload for a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkspace {
    pub name: String,
    pub slug: String,
    pub organization_id: i64,
}

// ============================================================================
// Documents and Fragments
// ============================================================================

/// A logical source document contributing N vector fragments.
///
/// `doc_id` is the stable external id and is never assumed equal to `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Relational primary key
    pub id: i64,

    /// Stable external id (UUID) used to correlate fragments
    pub doc_id: String,

    /// Display name, also part of the cache file key
    pub name: String,

    pub workspace_id: i64,
    pub organization_id: i64,
}

/// Insert payload for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub doc_id: String,
    pub name: String,
    pub workspace_id: i64,
    pub organization_id: i64,
}

impl NewDocument {
    /// Create a document payload with a freshly minted external id
    pub fn minted(name: impl Into<String>, workspace: &Workspace) -> Self {
        Self {
            doc_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            workspace_id: workspace.id,
            organization_id: workspace.organization_id,
        }
    }
}

/// One embedded chunk of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVector {
    pub id: i64,
    pub doc_id: String,

    /// Identifier known to the remote vector database
    pub vector_id: String,

    pub document_id: i64,
    pub workspace_id: i64,
    pub organization_id: i64,
}

/// Insert payload for a fragment row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocumentVector {
    pub doc_id: String,
    pub vector_id: String,
    pub document_id: i64,
    pub workspace_id: i64,
    pub organization_id: i64,
}

impl NewDocumentVector {
    /// Fragment row for a vector belonging to a persisted document
    pub fn for_document(document: &Document, vector_id: impl Into<String>) -> Self {
        Self {
            doc_id: document.doc_id.clone(),
            vector_id: vector_id.into(),
            document_id: document.id,
            workspace_id: document.workspace_id,
            organization_id: document.organization_id,
        }
    }
}

// ============================================================================
// Connector Configuration
// ============================================================================

/// Supported vector database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Chroma,
    Pinecone,
    Qdrant,
    Weaviate,
}

impl ConnectorType {
    pub const ALL: [ConnectorType; 4] = [
        ConnectorType::Chroma,
        ConnectorType::Pinecone,
        ConnectorType::Qdrant,
        ConnectorType::Weaviate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chroma => "chroma",
            Self::Pinecone => "pinecone",
            Self::Qdrant => "qdrant",
            Self::Weaviate => "weaviate",
        }
    }

    /// Human-facing product name
    pub fn label(&self) -> &'static str {
        match self {
            Self::Chroma => "Chroma",
            Self::Pinecone => "Pinecone",
            Self::Qdrant => "Qdrant",
            Self::Weaviate => "Weaviate",
        }
    }
}

impl std::fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConnectorType {
    type Err = VdmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "chroma" => Ok(Self::Chroma),
            "pinecone" => Ok(Self::Pinecone),
            "qdrant" => Ok(Self::Qdrant),
            "weaviate" => Ok(Self::Weaviate),
            _ => Err(VdmError::misconfigured(format!(
                "Unsupported connector for vector database: {s}"
            ))),
        }
    }
}

/// Connector record binding an organization to one vector database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: i64,
    pub organization_id: i64,

    #[serde(rename = "type")]
    pub kind: ConnectorType,

    /// Backend-specific settings object
    pub settings: serde_json::Value,
}

impl ConnectorConfig {
    pub fn new(organization_id: i64, kind: ConnectorType, settings: serde_json::Value) -> Self {
        Self {
            id: 0,
            organization_id,
            kind,
            settings,
        }
    }

    /// Decode the settings object into the backend's typed settings.
    ///
    /// Older rows stored settings as a JSON-encoded string; both forms are accepted.
    pub fn typed_settings<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.settings {
            serde_json::Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                VdmError::misconfigured(format!("{} settings are not valid JSON: {e}", self.kind))
            })?,
            other => other.clone(),
        };

        serde_json::from_value(value)
            .map_err(|e| VdmError::misconfigured(format!("Invalid {} settings: {e}", self.kind)))
    }
}

// ============================================================================
// Tests
// ============================================================================
