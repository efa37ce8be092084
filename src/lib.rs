//! Cache-aside / write-through query execution engine over a Redis-style
//! cache store and PostgreSQL.
//!
//! Application code calls the [`query::QueryExecutor`] with a relational
//! query, positional arguments, a result transform, and per-call
//! [`query::CacheOptions`]; the executor handles key routing, strategy
//! selection, batched store I/O, TTL policy, and invalidation fan-out.
//! The lock manager and transaction runner wrap multi-step operations;
//! the scanner and bulk utilities cover maintenance jobs.

pub mod bulk;
pub mod cache;
pub mod config;
mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod lock;
pub mod query;

pub use context::EngineContext;
pub use error::EngineError;
