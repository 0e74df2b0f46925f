//! Multi-layer type analysis for one call site.
//!
//! The candidate set starts from the first layer (the call signature) and is
//! refined by intersecting against the functions recorded for each enclosing
//! `(type, field index)` layer the called value was loaded through. Confined
//! types widen the set (a whole object of another type was copied into a
//! field); transit edges (casts between composites) are followed to a
//! fixpoint with a visited set so cyclic type references terminate.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::ir::{Function, Operand, Program, TypeId};

use super::facts::{FuncSet, TypeFacts};
use super::fingerprint::{hash_idx_hash, type_hash, type_idx_hash};
use super::layers::LayerWalker;

/// Resolve an indirect call through the layer walk. `None` is MLTA failure:
/// an empty first-layer set or an escaped layer; the caller decides whether
/// the signature fallback applies.
pub fn find_callees_with_mlta(
    prog: &Program,
    facts: &TypeFacts,
    func: &Function,
    called_value: &Operand,
    call_fty: TypeId,
) -> Option<FuncSet> {
    let types = &prog.types;

    let mut fs1 = facts.sig_funcs.get(&type_hash(types, call_fty)).cloned().unwrap_or_default();
    if fs1.is_empty() {
        // Nothing matches even the first layer; no point walking further.
        return None;
    }

    let empty = FuncSet::default();
    let mut first_idx: Option<i64> = None;

    for layer in LayerWalker::new(prog, func, called_value) {
        let th = type_hash(types, layer.ty);
        let tih = type_idx_hash(types, layer.ty, layer.idx);

        // An escaped type or slot means some assignment went through a path
        // the fact builder could not attribute; the layer refinement would be
        // unsound to trust.
        if facts.type_escape.contains(&th) || facts.type_escape.contains(&tih) {
            trace!(ty = %types.print(layer.ty), idx = layer.idx, "layer escaped");
            return None;
        }

        let first = *first_idx.get_or_insert(layer.idx);

        let fs2 = facts.type_funcs.get(&tih).unwrap_or(&empty);
        let mut fst: FuncSet = fs1.intersection(fs2).copied().collect();

        if let Some(confined) = facts.type_confine.get(&th) {
            for &h in confined {
                if let Some(extra) = facts.type_funcs.get(&hash_idx_hash(h, first)) {
                    fst.extend(extra.iter().copied());
                }
            }
        }

        let mut worklist = vec![th];
        let mut visited: FxHashSet<u64> = FxHashSet::default();
        visited.insert(th);
        while let Some(current) = worklist.pop() {
            let Some(sources) = facts.type_transit.get(&current) else { continue };
            for &h in sources {
                let fs2 = facts.type_funcs.get(&hash_idx_hash(h, layer.idx)).unwrap_or(&empty);
                fst = fs1.intersection(fs2).copied().collect();
                fs1 = fst.clone();
                if visited.insert(h) {
                    worklist.push(h);
                }
            }
        }

        fs1 = fst;
        trace!(ty = %types.print(layer.ty), idx = layer.idx, candidates = fs1.len(), "layer refined");
    }

    Some(fs1)
}
