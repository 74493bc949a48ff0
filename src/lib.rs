pub mod cli;
pub mod config;
pub mod correlate;
pub mod database;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod query;
pub mod report;
pub mod schema;
pub mod sensor;
pub mod table;
pub mod timeutil;
pub mod types;
pub mod utils;
