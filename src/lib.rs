// ABOUTME: Library entry point for the Subversion to Git migration engine
// ABOUTME: Exposes the phase machine, batch fetch engine, supervisor and job entry points

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod models;
pub mod phases;
pub mod progress;
pub mod remote;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod tools;
pub mod worker;

pub use context::EngineContext;
pub use error::{ErrorClass, MigratorError};
