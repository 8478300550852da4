pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod portal;
pub mod publish;
pub mod table;
