//! Worker process: accepts one map or reduce task at a time from the
//! coordinator and runs the user program over its input.

pub mod algorithm;
pub mod config;
pub mod engine;
pub mod mapper;
pub mod program;
pub mod reducer;
pub mod server;

pub use config::Config;
pub use engine::Worker;
pub use server::{build_router, WorkerState};
