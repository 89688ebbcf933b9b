//! Infrastructure layer
//!
//! Configuration loading and validation.

pub mod config;
