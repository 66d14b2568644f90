//! HTTP control API
//!
//! Served by `watch --http-port`; mirrors the `health`, `pause` and `resume`
//! CLI commands.

pub mod health;

pub use health::control_routes;
