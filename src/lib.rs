pub mod batch;
pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod payload;
pub mod progress;
pub mod recipients;
pub mod templates;
