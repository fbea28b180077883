use std::{io, time::Duration};

use thiserror::Error;

use crate::page::Geometry;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("named object {name:?} not found")]
    NotFound { name: String },

    #[error("named object {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("named object {name:?}: expected at least {expected} bytes, found {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("named object {name:?}: {reason}")]
    BadHeader { name: String, reason: String },

    #[error("{name:?} was created as {actual}, opener expected {expected}")]
    GeometryMismatch {
        name: String,
        expected: Geometry,
        actual: Geometry,
    },

    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("invalid page index {0} (expected 0 or 1)")]
    InvalidPage(usize),

    #[error("failed to launch display server: {0}")]
    Spawn(#[source] io::Error),

    #[error("display server exited before signalling readiness")]
    ServerExited,

    #[error("display server did not signal readiness within {0:?}")]
    StartupTimeout(Duration),

    #[error("session is closed")]
    Closed,

    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn os(op: &'static str, source: nix::errno::Errno) -> Self {
        Self::Os { op, source }
    }

    /// Errors that mean the server never became ready.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::ServerExited | Self::StartupTimeout(_)
        )
    }
}
