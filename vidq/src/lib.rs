//! vidq library crate.
//!
//! A media download queue: admission through an extractor, bounded concurrent downloads
//! supervised as child processes, and durable pending/history state in SQLite.

pub mod config;
pub mod database;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod services;
pub mod store;

pub use error::{Error, Result};
