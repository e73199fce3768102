//! Wharf - shared dependency resolution cache
//!
//! Sits between a build tool's resolver and remote artifact repositories.
//! Artifact bytes are stored once per checksum and copied out to logical
//! module locations; resolved module metadata is cached with a configurable
//! staleness policy for changing revisions. Many tasks and processes can
//! share one cache root safely.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod metadata;
pub mod staleness;
pub mod store;

pub use cache::CacheManager;
pub use error::{WharfError, WharfResult};
