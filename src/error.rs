use thiserror::Error;

use crate::models::ContentId;

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("comment {0} was already reported by this client")]
    DuplicateReport(ContentId),

    #[error("malformed client marker: {0}")]
    MalformedClientToken(String),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("comment flagging is disabled")]
    Disabled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
