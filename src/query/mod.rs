mod executor;
mod options;
mod transaction;

pub use executor::{JsonFallback, JsonGetOptions, QueryExecutor, QueryTransform};
pub use options::{CacheOptions, KeySpec, Multiplicity, PostReadTransform, Strategy};
pub use transaction::{step, TransactionRunner, TxOptions, TxStep};
