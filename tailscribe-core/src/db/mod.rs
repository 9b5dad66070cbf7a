//! Offset cache storage
//!
//! A small SQLite database that remembers, per session, the byte offset
//! the last parse pass reached and the file size at that point. On the
//! next launch a session can resume from there instead of byte 0.

pub mod repo;
pub mod schema;

pub use repo::{CachedOffset, OffsetCache};
