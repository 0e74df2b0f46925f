//! Signature-only fallback: an address-taken function is a candidate when
//! its parameter list is compatible with the call site.

use crate::ir::{Function, Operand, Program, TypeArena, TypeId, TypeKind};

use super::facts::{FuncSet, TypeFacts};

fn is_i8_ptr(types: &TypeArena, ty: TypeId) -> bool {
    types
        .pointee(ty)
        .is_some_and(|p| matches!(types.kind(p), TypeKind::Integer { bits: 8 }))
}

fn is_int_ptr(types: &TypeArena, ty: TypeId) -> bool {
    matches!(types.kind(ty), TypeKind::Integer { bits: 64 })
}

/// Candidates for an indirect call by type matching alone. The comparison is
/// conservative: after stripping equal levels of pointer wrapping, types must
/// be identical (the intern table already folds same-named structs from
/// different modules and same-width integers together), except that `i8*` is
/// treated as a universal pointer compatible with any pointer and with the
/// pointer-sized integer.
pub fn find_callees_with_type(
    prog: &Program,
    facts: &TypeFacts,
    caller: &Function,
    args: &[Operand],
    call_fty: TypeId,
) -> FuncSet {
    let types = &prog.types;
    let mut out = FuncSet::default();

    let cs_ret = match types.kind(call_fty) {
        TypeKind::Function { ret, .. } => Some(*ret),
        _ => None,
    };

    'candidates: for &f in &facts.address_taken {
        let cand = prog.func(f);
        if cand.is_intrinsic() {
            continue;
        }
        let params = cand.params(types);
        if cand.is_vararg(types) {
            // Compare only the fixed prefix of a variadic candidate.
            if args.len() < params.len() {
                continue;
            }
        } else if params.len() != args.len() {
            continue;
        }
        if let (Some(cs), Some(fr)) = (cs_ret, cand.ret_type(types)) {
            if cs != fr {
                continue;
            }
        }

        for (i, &defined) in params.iter().enumerate() {
            let Some(actual) = prog.operand_type(caller, &args[i]) else {
                continue 'candidates;
            };
            if defined == actual {
                continue;
            }
            let (mut dt, mut at) = (defined, actual);
            while let (Some(d), Some(a)) = (types.pointee(dt), types.pointee(at)) {
                dt = d;
                at = a;
            }
            if dt == at {
                continue;
            }
            if (is_i8_ptr(types, dt) && (types.is_pointer(at) || is_int_ptr(types, at)))
                || (is_i8_ptr(types, at) && (types.is_pointer(dt) || is_int_ptr(types, dt)))
            {
                continue;
            }
            continue 'candidates;
        }
        out.insert(f);
    }
    out
}
