//! Thin HTTP facade over the pipeline.

pub mod routes;
pub mod server;
pub mod types;

pub use server::{serve, ApiState};
