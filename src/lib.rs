// Internal modules required when compiled as a library for tests.
pub mod alerts;
pub mod anomaly;
pub mod app;
pub mod collector;
pub mod config;
pub mod db;
pub mod evaluate;
pub mod http;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod recommend;
pub mod state;
pub mod store;
// Re-export commonly used types for tests
pub use model::{AlertCandidate, MetricBatch, Severity};
pub use state::SharedState;
