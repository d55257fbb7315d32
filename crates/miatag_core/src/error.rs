use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MiaError>;

/// Failures surfaced by the tagging pipeline.
///
/// `Fetch` and `Parse` abort a run; the rest are collected into the
/// [`RunReport`](crate::pipeline::RunReport) and the batch keeps going.
#[derive(Error, Debug)]
pub enum MiaError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("MIA list not recognized: {0}")]
    Parse(String),

    #[error("{}: not a DAT catalog ({reason})", path.display())]
    CatalogFormat { path: PathBuf, reason: String },

    #[error("{}: {reason}", path.display())]
    Path { path: PathBuf, reason: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MiaError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Parse(_) | Self::Config(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
