//! # Tessera
//!
//! Command-line administration for tessera-core graphs.
//!
//! This crate exposes the CLI and configuration modules for integration
//! testing; the binary lives in `main.rs`.

pub mod cli;
pub mod config;
