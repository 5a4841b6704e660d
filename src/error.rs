// src/error.rs
//! Typed errors for the failure classes callers need to tell apart.
//!
//! Most of the crate propagates `anyhow::Error`; these types sit underneath
//! so the driver can recognise a collective abort or a data-integrity
//! failure with `downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    /// Rejected configuration combination, caught before any I/O
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Backend operation failed on the path under test
    #[error("{op} failed on {path}")]
    Backend {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Verification mismatches promoted to fatal by `abort_on_data_error`
    #[error("data integrity check failed: {errors} mismatching items")]
    DataIntegrity { errors: u64 },

    /// A transfer or check buffer could not be allocated
    #[error("unable to allocate a {bytes} byte buffer")]
    Alloc { bytes: usize },

    /// Namespace math produced an unusable shape
    #[error("namespace error: {0}")]
    Namespace(String),
}

impl BenchError {
    pub fn backend(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Backend {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type BenchResult<T> = Result<T, BenchError>;
