//! Repository layer for database access.

pub mod download;

pub use download::*;
