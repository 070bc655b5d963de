use std::path::Path;

use rangewatch_core::AnalyzerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("Cannot access '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse JSON in '{path}': {source}")]
    ParseJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cannot write JSON: {0}")]
    WriteJson(#[from] serde_json::Error),
    #[error("No home directory to derive a data directory from")]
    NoProjectDirs,
    #[error("No such subject '{0}'")]
    NoSuchSubject(String),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("Shutdown")]
    Shutdown,
}

impl ServerError {
    pub(crate) fn file(path: &Path, source: std::io::Error) -> Self {
        ServerError::File {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn parse_json(path: &Path, source: serde_json::Error) -> Self {
        ServerError::ParseJson {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<ServerError> for AnalyzerError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Analyzer(e) => e,
            other => AnalyzerError::Store(other.to_string()),
        }
    }
}
