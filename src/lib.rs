pub mod activity;
pub mod app;
pub mod cli;
pub mod config;
pub mod decode;
pub mod errors;
pub mod ingest;
pub mod poller;
pub mod storage;
pub mod threading;
pub mod transport;
pub mod types;
