pub mod auth;
pub mod config;
pub mod dial;
pub mod modem;
pub mod server;
pub mod session;
pub mod sites;
pub mod supervisor;
pub mod telemetry;
