mod batch;
mod command;
pub mod flat;
mod keys;
mod memory;
pub mod pack;
mod redis;
mod scan;

pub use batch::{run_pipeline, Batch};
pub use command::{Arg, BatchMode, Command, Reply, ScanTarget, Store};
pub use keys::{normalize_json_path, KeyRouter};
pub use memory::MemoryStore;
pub use pack::PackSchema;
pub use redis::RedisStore;
pub use scan::{Consumer, ScanOptions, ScanOutcome, Scanner};
