use std::path::PathBuf;

/// Errors raised by the evaluation core.
///
/// Command code wraps these in `anyhow` with the file or model being
/// processed attached as context.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("schema error in {context}: {message}")]
    Schema { context: String, message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("data error: {message}")]
    Data { message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EvalError {
    pub fn schema(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;
