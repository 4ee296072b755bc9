//! Core types and errors for the Atlas resolver
//!
//! This crate provides the foundational types shared by the image loader and
//! the IL2CPP metadata engine.

pub mod error;
pub mod types;
pub mod config;

pub use error::{Error, Result};
pub use types::*;
pub use config::EngineConfig;
