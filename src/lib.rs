pub mod agent;
pub mod channel;
pub mod config;
pub mod engine;
pub mod export;
pub mod sink;
pub mod tracer;
