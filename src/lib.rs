//! Incremental sync of a rate-limited, reverse-paginated feed API into a
//! local archive, with a live in-memory object cache on top.

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod sync;
