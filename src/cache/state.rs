//! Resolution states and lookup results

use crate::metadata::{ModuleRevisionMetadata, ResolverMetadata};
use std::collections::HashSet;
use std::fmt;

/// Where a module revision stands in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Never resolved, or evicted
    Unresolved,
    /// Cached and usable without remote calls
    ResolvedFresh,
    /// Cached, but the staleness policy demands a re-check
    ResolvedStale,
    /// Another task or process holds the module lock
    ResolvingInProgress,
}

impl ResolutionState {
    /// Whether cached metadata can be served as is
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::ResolvedFresh)
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::ResolvedFresh => write!(f, "fresh"),
            Self::ResolvedStale => write!(f, "stale"),
            Self::ResolvingInProgress => write!(f, "resolving"),
        }
    }
}

/// A cached resolution with its staleness verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResolution {
    pub metadata: ModuleRevisionMetadata,
    /// `ResolvedFresh` or `ResolvedStale`
    pub state: ResolutionState,
}

impl CachedResolution {
    pub fn is_fresh(&self) -> bool {
        self.state.is_fresh()
    }
}

/// Difference between the persisted resolver set and the current one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverDrift {
    /// Configured now, unknown to the cache
    pub added: Vec<ResolverMetadata>,
    /// Known to the cache, no longer configured
    pub removed: Vec<ResolverMetadata>,
}

impl ResolverDrift {
    /// Compare two resolver sets; both sides come back sorted
    pub fn between(previous: &HashSet<ResolverMetadata>, current: &HashSet<ResolverMetadata>) -> Self {
        let mut added: Vec<_> = current.difference(previous).cloned().collect();
        let mut removed: Vec<_> = previous.difference(current).cloned().collect();
        added.sort();
        removed.sort();
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
