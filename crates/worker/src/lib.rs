// Benchflow worker
// Decision: The engine runs in-process with the pools; starters reach it over HTTP
// Decision: Executors are resolved through ExecutorRegistry before any pool starts
// Decision: DATABASE_URL selects the PostgreSQL workflow store, otherwise runs live in memory

pub mod config;
pub mod host;

pub use config::{KindName, WorkerConfig};
pub use host::{queues_for, serve, HostError, Worker};
