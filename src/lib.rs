pub mod classifier;
pub mod config;
pub mod jobs;
pub mod llm;
pub mod schema;
pub mod shared;
pub mod stats;
pub mod tickets;
