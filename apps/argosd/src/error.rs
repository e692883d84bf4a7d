use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read monitor document {path}: {source}")]
    Read { path: PathBuf, source: IoError },
    #[error("monitor document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
