//! HTTP admin surface and process wiring for the VoxNexus session core.

pub mod app;
pub mod http;

pub use app::{build_router, AppState};
