//! Error taxonomy for the reconciliation agent
//!
//! Almost nothing here is fatal: each variant describes a failure that is
//! logged once and degrades the current cycle (a dropped key, an empty
//! query result, a withheld artifact) instead of aborting it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurokError {
    /// A configuration value failed type, allowed-value or path checks.
    #[error("invalid value for \"{key}\": {reason}")]
    Validation { key: String, reason: String },

    /// A DNS or orchestrator API query failed or timed out.
    #[error("resolution of {query} failed: {reason}")]
    Resolution { query: String, reason: String },

    /// A template or helper function failed while rendering an artifact.
    #[error("render of {target} failed: {reason}")]
    Render { target: String, reason: String },

    /// Writing an artifact to disk failed.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store backend is unreachable or misconfigured.
    #[error("store backend {backend} unavailable: {reason}")]
    Backend { backend: String, reason: String },
}

impl SurokError {
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn resolution(query: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resolution {
            query: query.into(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}
