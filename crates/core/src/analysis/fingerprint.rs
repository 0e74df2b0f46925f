//! Stable fingerprints for types, functions and call sites.
//!
//! Every hash is derived from the canonical printed form of a type with
//! whitespace stripped, so two modules that spell the same type agree on the
//! fingerprint even though their IR objects are distinct. `void (...)` (an
//! unprototyped C function) canonicalizes to `void ()` so zero-arg prototypes
//! and unprototyped declarations do not miss each other.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::ir::{Callee, FuncId, Linkage, Program, TypeArena, TypeId, TypeKind};

/// Deterministic string hash used for every fact-base key.
pub fn stable_hash(s: &str) -> u64 {
    let mut h = FxHasher::default();
    h.write(s.as_bytes());
    h.finish()
}

fn canonicalize(mut printed: String) -> String {
    printed.retain(|c| !c.is_whitespace());
    if printed.contains("void(...)") {
        printed = printed.replace("void(...)", "void()");
    }
    printed
}

/// Canonical (hashed) spelling of a type.
pub fn type_string(types: &TypeArena, ty: TypeId) -> String {
    canonicalize(types.print(ty))
}

pub fn type_hash(types: &TypeArena, ty: TypeId) -> u64 {
    stable_hash(&type_string(types, ty))
}

/// Key for a `(type, field index)` pair, composed so that a raw type hash can
/// also be extended by an index after the fact.
pub fn hash_idx_hash(h: u64, idx: i64) -> u64 {
    h.wrapping_add(stable_hash(&idx.to_string()))
}

pub fn type_idx_hash(types: &TypeArena, ty: TypeId, idx: i64) -> u64 {
    hash_idx_hash(type_hash(types, ty), idx)
}

/// Fingerprint of a function. With `with_name` the symbol name participates,
/// and file-local functions are salted with their source file so identically
/// named statics in different files stay distinct.
pub fn func_hash(prog: &Program, f: FuncId, with_name: bool) -> u64 {
    let func = prog.func(f);
    let mut out = prog.types.print(func.fty);
    if with_name {
        out.push_str(&func.name);
        if func.linkage == Linkage::Internal {
            if let Some(sp) = &func.subprogram {
                out = format!("{}:{}", sp.file, out);
            }
        }
    }
    stable_hash(&canonicalize(out))
}

/// Fingerprint of a call site: the resolved direct callee's hash when there
/// is one, otherwise the hash of the call-site function type.
pub fn call_hash(prog: &Program, callee: &Callee, fty: TypeId) -> u64 {
    match callee {
        Callee::Direct(f) => func_hash(prog, *f, true),
        _ => type_hash(&prog.types, fty),
    }
}

/// Fingerprint of `f`'s nameless signature with the first parameter's pointee
/// replaced by `receiver`. This is how a C++ override whose `this` type
/// differs from the base method still lands in the same signature bucket.
pub fn func_hash_with_receiver(prog: &Program, f: FuncId, receiver: TypeId) -> u64 {
    let func = prog.func(f);
    let types = &prog.types;
    let TypeKind::Function { ret, params, vararg } = types.kind(func.fty) else {
        return func_hash(prog, f, false);
    };
    let mut out = types.print(*ret);
    out.push_str(" (");
    for (i, &p) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if i == 0 {
            let mut depth = 0;
            let mut t = p;
            while let Some(inner) = types.pointee(t) {
                depth += 1;
                t = inner;
            }
            out.push_str(&types.print(receiver));
            for _ in 0..depth {
                out.push('*');
            }
        } else {
            out.push_str(&types.print(p));
        }
    }
    if *vararg {
        if !params.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }
    out.push(')');
    stable_hash(&canonicalize(out))
}
