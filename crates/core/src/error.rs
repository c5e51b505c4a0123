//! Error taxonomy shared by every layer.
//!
//! `StoreError` and `OrchestratorError` stay close to their sources; the
//! coordinator surfaces everything to callers as `KeelError`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SemVer;

pub type KeelResult<T> = Result<T, KeelError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Cpu,
    Ram,
    ExtServices,
    IntServices,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QuotaDimension::Cpu => "cpu",
            QuotaDimension::Ram => "ram",
            QuotaDimension::ExtServices => "external services",
            QuotaDimension::IntServices => "internal services",
        })
    }
}

/// First dimension that would go over its ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaViolation {
    pub dimension: QuotaDimension,
    pub limit: u64,
    pub used: u64,
    pub requested: u64,
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: limit {}, used {}, requested {}",
            self.dimension, self.limit, self.used, self.requested
        )
    }
}

/// Failures of the remote orchestrator. Timeouts and cancellation count as
/// orchestrator failures for compensation purposes.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("network: {0}")]
    Network(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("begin transaction: {0}")]
    Begin(String),
    #[error("commit transaction: {0}")]
    Commit(String),
    #[error("rollback transaction: {0}")]
    Rollback(String),
    #[error("transaction body panicked: {0}")]
    Panicked(String),
    #[error("unique constraint: {0}")]
    Conflict(String),
    #[error("query: {0}")]
    Query(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum KeelError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaViolation),
    #[error("validation: {0}")]
    Validation(String),
    #[error("unable to delete active version {0}")]
    UnableDeleteActiveVersion(SemVer),
    #[error("orchestrator: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("inconsistent state during {operation}: remote error: {remote}; compensation error: {compensation}")]
    InconsistentState {
        operation: String,
        remote: String,
        compensation: String,
    },
    #[error("storage: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for KeelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => KeelError::AlreadyExists(what),
            other => KeelError::Storage(other),
        }
    }
}

impl From<QuotaViolation> for KeelError {
    fn from(v: QuotaViolation) -> Self {
        KeelError::QuotaExceeded(v)
    }
}

/// Coarse classification for exit codes, metrics labels and API mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    QuotaExceeded,
    Validation,
    Orchestrator,
    InconsistentState,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Validation => "validation",
            ErrorKind::Orchestrator => "orchestrator",
            ErrorKind::InconsistentState => "inconsistent_state",
            ErrorKind::Storage => "storage",
        }
    }
}

impl KeelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeelError::NotFound(_) => ErrorKind::NotFound,
            KeelError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            KeelError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            KeelError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            KeelError::Validation(_) | KeelError::UnableDeleteActiveVersion(_) => ErrorKind::Validation,
            KeelError::Orchestrator(_) => ErrorKind::Orchestrator,
            KeelError::InconsistentState { .. } => ErrorKind::InconsistentState,
            KeelError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        KeelError::NotFound(what.to_string())
    }

    pub fn denied(what: impl fmt::Display) -> Self {
        KeelError::PermissionDenied(what.to_string())
    }
}
