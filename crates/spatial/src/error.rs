//! # Spatial Errors
//!
//! Error types for the spatial core.

use thiserror::Error;

use crate::types::{CacheRef, CellId};

/// Spatial core error types.
#[derive(Error, Debug, Clone)]
pub enum SpatialError {
    // ========================================================================
    // Setup Errors
    // ========================================================================

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    // ========================================================================
    // Graph Errors
    // ========================================================================

    #[error("Cell not found: {0}")]
    UnknownCell(CellId),

    #[error("Cell already registered: {0}")]
    DuplicateCell(CellId),

    #[error("Cell {child} already has parent {parent}")]
    AlreadyParented { child: CellId, parent: CellId },

    #[error("Cell {child} is not a child of {parent}")]
    NotAChild { child: CellId, parent: CellId },

    #[error("Invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("Cell {0} is live, local bounds cannot change")]
    CellIsLive(CellId),

    #[error("Cell {0} is not a view cell")]
    NotAView(CellId),

    // ========================================================================
    // Transaction Errors
    // ========================================================================

    #[error("Task {task} rejected: {reason}")]
    TaskRejected { task: String, reason: String },

    #[error("Client cache not found: {0}")]
    UnknownCache(CacheRef),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl SpatialError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a hierarchy error
    pub fn hierarchy(msg: impl Into<String>) -> Self {
        Self::InvalidHierarchy(msg.into())
    }

    /// Create a rejected-task error
    pub fn rejected(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskRejected {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Errors a cluster node is expected to see during normal operation
    /// (warm-restart skew, dropped deltas). Callers log these and move on.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SpatialError::UnknownCell(_)
                | SpatialError::TaskRejected { .. }
                | SpatialError::UnknownCache(_)
        )
    }
}

/// Result type for spatial operations.
pub type SpatialResult<T> = Result<T, SpatialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(SpatialError::UnknownCell(CellId::new(4)).is_benign());
        assert!(SpatialError::rejected("load-delta", "queue full").is_benign());
        assert!(!SpatialError::config("space_size must be positive").is_benign());
        assert!(!SpatialError::CellIsLive(CellId::new(2)).is_benign());
    }

    #[test]
    fn test_messages() {
        let err = SpatialError::AlreadyParented {
            child: CellId::new(7),
            parent: CellId::new(3),
        };
        assert_eq!(err.to_string(), "Cell cell-7 already has parent cell-3");
    }
}
