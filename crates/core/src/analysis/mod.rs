//! The indirect-call analysis: fingerprints, the fact base, the layer
//! walker, the MLTA and TA resolvers, the vtable pass, and the dispatcher
//! that ties them together.

pub mod callgraph;
pub mod facts;
pub mod fingerprint;
pub mod layers;
pub mod mlta;
pub mod ta;
pub mod vtable;

pub use callgraph::{CallGraphOptions, CallGraphPass};
pub use facts::{FuncSet, TypeFacts};
pub use vtable::{VirtualCallTargets, resolve_virtual_calls};

/// How indirect call targets are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisType {
    /// Prefer MLTA, fall back to TA when MLTA fails.
    #[default]
    MltaPref,
    /// MLTA only; failed sites produce no rows.
    MltaOnly,
    /// Signature matching only.
    TaOnly,
}

/// C++ symbol demangling policy for emitted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Demangle {
    /// Use the debug-info name when present.
    #[default]
    DebugOnly,
    /// Demangle every symbol.
    All,
    /// Emit raw symbol names.
    None,
}
