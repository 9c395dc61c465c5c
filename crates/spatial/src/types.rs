//! Core identifiers for the spatial core
//!
//! ## Table of Contents
//! - **CellId**: Globally unique cell identifier
//! - **PersistentRef**: Id of the durable object backing a cell
//! - **CacheRef**: Id of the durable per-view client cache object
//! - **Identity**: Owner that transactional work is scheduled for
//! - **CellKind**: Ordinary cell or avatar view cell

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(u64);

impl CellId {
    /// Create a CellId from a u64
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell-{}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Id of the durable-store object a spatial cell mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistentRef(u64);

impl PersistentRef {
    /// Create a reference from a raw store id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PersistentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds-{}", self.0)
    }
}

/// Id of the durable client-side cache object a view reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheRef(u64);

impl CacheRef {
    /// Create a reference from a raw store id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache-{}", self.0)
    }
}

/// Identity a transactional task runs as
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Create an identity from a principal name
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    /// Identity used for work the node performs on its own behalf
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Principal name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of spatial cell. View cells own a [`ViewCache`](crate::ViewCache)
/// while their avatar is logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    /// Ordinary world object
    Standard,
    /// Avatar view
    View,
}

impl CellKind {
    /// Class name reported in cell descriptions
    pub fn class_name(&self) -> &'static str {
        match self {
            CellKind::Standard => "Cell",
            CellKind::View => "ViewCell",
        }
    }

    /// True for avatar view cells
    pub fn is_view(&self) -> bool {
        matches!(self, CellKind::View)
    }
}
