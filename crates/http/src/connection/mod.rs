mod body_reader;
mod config;
mod http_connection;
mod response_writer;
mod stats;

pub use config::{EngineConfig, ResponseExceptionHandler};
pub use http_connection::HttpConnection;
pub use stats::ConnectionStats;
