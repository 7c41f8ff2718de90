//! Spillway Web - HTTP front for the streaming gateway
//!
//! One endpoint, `/stream?id=<message>`, translating HTTP range requests
//! into chunk fetches against the upstream worker pool.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, build_router, run_server};
