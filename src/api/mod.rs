//! HTTP route definitions.
//!
//! `health` is a root-level liveness/readiness pair in the teacher's
//! convention (merged directly into the router, not nested under `/api`);
//! `playback` is the full C7 surface, nested under `/api/playback` via
//! [`ServicesManagerBuilder::add_api_routes`](crate::services::manager::ServicesManagerBuilder::add_api_routes).

mod extract;
pub mod health;
pub mod playback;
