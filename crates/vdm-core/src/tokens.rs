//! Token budget check for embedding input
//!
//! Uses the cl100k_base encoding shared by the OpenAI embedding models.

use once_cell::sync::OnceCell;
use tiktoken_rs::CoreBPE;

use crate::{Result, VdmError};

/// Maximum tokens accepted by the embedding model
pub const MAX_EMBEDDING_TOKENS: usize = 8191;

/// Head-room kept below the model limit
pub const TOKEN_BUFFER: usize = 50;

static ENCODER: OnceCell<CoreBPE> = OnceCell::new();

fn encoder() -> Result<&'static CoreBPE> {
    ENCODER.get_or_try_init(|| {
        tiktoken_rs::cl100k_base()
            .map_err(|e| VdmError::ValidationError(format!("Tokenizer unavailable: {e}")))
    })
}

/// Token count of a validated text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub length: usize,
}

/// Check that text is non-empty and fits the embedding budget
pub fn validate_embedding_text(text: &str) -> Result<TokenEstimate> {
    let length = encoder()?.encode_ordinary(text).len();

    if length == 0 {
        return Err(VdmError::ValidationError(
            "Text content is empty, nothing to embed".to_string(),
        ));
    }
    if length + TOKEN_BUFFER > MAX_EMBEDDING_TOKENS {
        return Err(VdmError::ValidationError(format!(
            "Text content is {length} tokens, the embedding limit is {}",
            MAX_EMBEDDING_TOKENS - TOKEN_BUFFER
        )));
    }

    Ok(TokenEstimate { length })
}
