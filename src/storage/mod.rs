//! Durable dedup store.
//!
//! A single SQLite table remembers every entry ever announced (or
//! deliberately suppressed), keyed by `(feed_id, entry_id)`. Each feed task
//! loads its partition into a [`SeenCache`] at startup so the per-poll
//! membership check is synchronous.

mod db;

pub use db::{Database, SeenCache, StoreError};
