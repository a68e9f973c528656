//! Error types for the todo store.

use crate::types::{Sequence, TodoId};
use thiserror::Error;

/// Main error type for store and client operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Todo already exists: {0}")]
    DuplicateId(TodoId),

    #[error("Todo not found: {0}")]
    NotFound(TodoId),

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Transaction rejected: {0}")]
    Transaction(String),

    #[error("Client is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} called from inside a live query callback")]
    ReentrantCall(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch at {sequence:?}: expected {expected}, got {got}")]
    ChecksumMismatch {
        sequence: Sequence,
        expected: u32,
        got: u32,
    },

    #[error("Store is locked by another process")]
    Locked,
}

/// Coarse classification of a failure, as seen by the caller of a query or
/// an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store could not produce a first result.
    Load,
    /// A batch was rejected and nothing was applied.
    Transaction,
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Load(_)
            | StoreError::Closed
            | StoreError::Config(_)
            | StoreError::Locked
            | StoreError::InvalidFormat(_)
            | StoreError::ChecksumMismatch { .. }
            | StoreError::Deserialization(_) => ErrorKind::Load,
            StoreError::Io(_)
            | StoreError::DuplicateId(_)
            | StoreError::NotFound(_)
            | StoreError::Schema(_)
            | StoreError::Transaction(_)
            | StoreError::ReentrantCall(_)
            | StoreError::Serialization(_) => ErrorKind::Transaction,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
