//! vgate HTTP server - gateway routing and per-model serving entrypoints

pub mod api;
pub mod error;
pub mod state;
