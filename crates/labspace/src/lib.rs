//! Per-user application sessions in containers, reachable through a
//! cookie-routed reverse proxy.

pub mod api;
pub mod container;
pub mod proxy;
pub mod session;
