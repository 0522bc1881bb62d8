//! Sirius Common Library
//!
//! This crate provides shared constants, name derivation and configuration
//! loading for all sirius workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Build-time identity, layout limits and timing defaults
//! - [`namespace`] - Hashed names for shared memory objects and lock files
//! - [`config`] - Configuration loading traits and the transport configuration
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! sirius = { package = "sirius_common", path = "../sirius_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use sirius_common::consts::*;
//! use sirius_common::config::{ConfigLoader, TransportConfig};
//! ```

pub mod config;
pub mod consts;
pub mod namespace;
