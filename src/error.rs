use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KarmaError {
    /// A required column is missing or cannot be resolved.
    #[error("{table} missing columns: {missing:?}")]
    Schema { table: String, missing: Vec<String> },

    /// Columns exist but the data cannot support the operation.
    #[error("{}", describe(.message, .names))]
    Validation { message: String, names: Vec<String> },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KarmaError>;

impl KarmaError {
    pub fn schema(table: impl Into<String>, missing: Vec<String>) -> Self {
        KarmaError::Schema {
            table: table.into(),
            missing,
        }
    }

    pub fn validation(message: impl Into<String>, names: Vec<String>) -> Self {
        KarmaError::Validation {
            message: message.into(),
            names,
        }
    }
}

fn describe(message: &str, names: &[String]) -> String {
    if names.is_empty() {
        message.to_string()
    } else {
        format!("{}: {:?}", message, names)
    }
}
