//! callgraph-core
//!
//! Core library for whole-program call graph construction from compiled IR
//! modules, including the multi-layer type analysis (MLTA) that resolves
//! indirect calls, its type-analysis (TA) fallback, and an optional C++
//! vtable resolver.
//!
//! This crate defines the internal IR model, the analysis passes, the CSV
//! output sink, and the module-loading backends.
//!
//! The goal is to keep all substantive logic here so it is fully testable and
//! reusable from multiple frontends (CLI, Python bindings, etc.).

pub mod ir;
pub mod analysis;
pub mod output;
pub mod backends;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
