// Library exports for the docklog container log multiplexer

pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod mux;
pub mod perf;
