pub mod agent;
pub mod config;
pub mod database;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod payload;
pub mod runtime;
pub mod server;
pub mod tools;
