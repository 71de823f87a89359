//! Backend adapters
//!
//! Chroma, Pinecone and Weaviate are spoken to over REST with reqwest;
//! Qdrant goes through qdrant-client.

pub mod chroma;
pub mod pinecone;
pub mod qdrant;
pub mod weaviate;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use chroma::{ChromaConnector, ChromaSettings};
pub use pinecone::{PineconeConnector, PineconeSettings};
pub use qdrant::{QdrantConnector, QdrantSettings};
pub use weaviate::{WeaviateConnector, WeaviateSettings};

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use vdm_core::{Result, VdmError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared HTTP client for REST adapters
pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| VdmError::misconfigured(format!("Failed to build HTTP client: {e}")))
}

/// Classify a transport error: network failures are transient
pub(crate) fn transport_error(backend: &str, e: reqwest::Error) -> VdmError {
    if e.is_builder() {
        VdmError::misconfigured(format!("{backend}: invalid request: {e}"))
    } else {
        VdmError::unreachable(format!("{backend}: request failed: {e}"))
    }
}

/// Fail on non-success status, keeping the body in the message
pub(crate) async fn check_status(backend: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{backend}: HTTP {status}: {body}");
    Err(match status.as_u16() {
        401 | 403 => VdmError::misconfigured(message),
        _ => VdmError::VectorDbError(message),
    })
}

/// Check status and decode a JSON body
pub(crate) async fn json_body<T: DeserializeOwned>(backend: &str, response: Response) -> Result<T> {
    check_status(backend, response)
        .await?
        .json()
        .await
        .map_err(|e| VdmError::VectorDbError(format!("{backend}: invalid response body: {e}")))
}

/// Strip a trailing slash so paths can be appended
pub(crate) fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
