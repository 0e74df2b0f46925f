//! callgraph CLI support library.
//!
//! The command helpers live here (rather than in `main.rs`) so integration
//! tests and other frontends can drive them directly.

pub mod commands;
