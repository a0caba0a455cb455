pub mod config;
pub mod crl;
pub mod crypto;
pub mod telemetry;
