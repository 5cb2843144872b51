//! Backwash - streaming media cache layer

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate sits between a slow, sequentially-read data source (network
//! file, optical media, remote share) and a media-playback consumer. The
//! consumer reads forward most of the time but occasionally seeks: short
//! distances forward while scrubbing, or backward into recently-played
//! material. The cache absorbs source latency and jitter, keeps a rewind
//! window behind the play cursor, and preserves a second independent window
//! of history so that seeking away and back does not force an expensive
//! re-read from the origin.
//!
//! Three realizations of one contract:
//!
//! - [`FileSpoolCache`] - an on-disk spool, effectively unbounded, for
//!   long-running playback with a large back buffer.
//! - [`CircularCache`] - a fixed-size in-memory ring holding up to two
//!   disjoint windows of the source at once.
//! - [`DoubleCache`] - a composite pair of peer caches switched by an
//!   age-based policy.

pub mod cache;
pub mod config;

// Re-export main types for convenient access
pub use cache::{CacheError, CacheStrategy, CircularCache, DoubleCache, FileSpoolCache};
pub use config::CacheConfig;
