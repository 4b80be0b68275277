//! Shroud Core - Buffer pooling, configuration, and shared types
//!
//! This crate contains the foundational pieces used across all Shroud
//! components. It has no dependencies on transport or TLS-engine code.

pub mod bucket;
pub mod buffer;
pub mod config;
pub mod pool;

pub use bucket::{BucketStats, SUBPOOL_FAST_MAX};
pub use buffer::{BufRetention, PooledBuf};
pub use config::{Config, ConfigError, ExecutorSettings, PoolSettings, SessionSettings};
pub use pool::{BufferPool, Domain, DomainStats, PoolConfig, Sizing, CAP_CHECK_INTERVAL};

/// Default capacity-class factor in bytes (1 KB)
pub const DEFAULT_FACTOR: usize = 1024;

/// Default largest pooled buffer size (64 KB)
pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024;
