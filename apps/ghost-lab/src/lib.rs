pub mod config;
pub mod engine;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
