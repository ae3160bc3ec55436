use thiserror::Error;

/// Errors produced by the clinical review core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Knowledge base unavailable: {0}")]
    KnowledgeBase(String),

    #[error("Decision model call failed: {0}")]
    ModelCall(String),

    #[error("Decision model response unusable: {0}")]
    ModelResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
