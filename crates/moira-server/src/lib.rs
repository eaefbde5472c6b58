//! Process wiring for the `moira` binary: configuration, logging, seed
//! import and the startup of every pipeline stage.

pub mod app;
pub mod config;
pub mod logging;
pub mod seed;
