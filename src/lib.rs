pub mod builtin;
pub mod cache;
pub mod commands;
pub mod core;
pub mod environment;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod ui;
