//! Background service lifecycle (`Service` trait + `ServicesManager`) and the
//! HTTP listener service built on top of it.

pub mod http_server;
pub mod manager;

pub use http_server::HttpServerService;
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
