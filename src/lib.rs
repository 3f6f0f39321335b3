pub mod audio;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod indexer;
pub mod multiplexer;
pub mod queue;
pub mod record;
pub mod service;
pub mod sources;
pub mod stats;
pub mod supervisor;
pub mod uploader;
