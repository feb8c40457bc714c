pub mod collectors;
pub mod config;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod state;
