pub mod agent;
pub mod checker;
pub mod command;
pub mod config;
pub mod error;
pub mod metric;
pub mod output;
pub mod output_cloudwatch;
pub mod output_mackerel;
pub mod output_print;
pub mod payload;
pub mod router;
pub mod scheduler;
pub mod shutdown;
pub mod sigv4;

pub use error::Error;
