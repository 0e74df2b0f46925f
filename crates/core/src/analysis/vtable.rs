//! Virtual-call resolution over a whole-program C++ module.
//!
//! Devirtualizable sites are found through the `llvm.type.test` intrinsic:
//! `llvm.assume(llvm.type.test(%vtable, !"typeid"))` asserts that `%vtable`
//! points into a virtual table of the named type set. Every indirect call
//! whose function pointer is loaded at `%vtable + offset` belongs to the
//! vtable slot `(typeid, offset)`; the slot's targets are read straight out
//! of the constant initializers of the type-annotated vtable globals.

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::ir::{
    Callee, Constant, FuncId, Function, GepIndex, InstId, InstKind, ModuleId, Operand, Program,
    Stripped, TypeArena, TypeId, strip_operand,
};

use super::facts::FuncSet;

const TYPE_TEST: &str = "llvm.type.test";
const ASSUME: &str = "llvm.assume";
const PURE_VIRTUAL: &str = "__cxa_pure_virtual";

/// Per-call-instruction candidate sets produced by the vtable pass.
#[derive(Debug, Default)]
pub struct VirtualCallTargets {
    candidates: FxHashMap<(FuncId, InstId), FuncSet>,
}

impl VirtualCallTargets {
    pub fn get(&self, func: FuncId, inst: InstId) -> Option<&FuncSet> {
        self.candidates.get(&(func, inst))
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn add(&mut self, site: (FuncId, InstId), targets: &[FuncId]) {
        self.candidates.entry(site).or_default().extend(targets.iter().copied());
    }

    /// Fold another pass result in (a linked input may hold several modules).
    pub fn merge(&mut self, other: VirtualCallTargets) {
        for (site, targets) in other.candidates {
            self.candidates.entry(site).or_default().extend(targets);
        }
    }
}

/// Resolve the virtual call sites of one (whole-program linked) module.
pub fn resolve_virtual_calls(prog: &Program, mid: ModuleId) -> VirtualCallTargets {
    let mut result = VirtualCallTargets::default();
    let module = prog.module(mid);

    // Group devirtualizable call sites into vtable slots.
    let mut slots: FxHashMap<(String, u64), Vec<(FuncId, InstId)>> = FxHashMap::default();
    for &fid in &module.functions {
        let func = prog.func(fid);
        if func.is_declaration {
            continue;
        }
        scan_type_test_users(prog, fid, func, &mut slots);
    }
    if slots.is_empty() {
        warn!(module = %module.name, "missing required intrinsic functions");
        return result;
    }

    // Rebuild type metadata into a map for easy lookup.
    let mut type_id_map: FxHashMap<&str, Vec<(&crate::ir::GlobalVariable, u64)>> =
        FxHashMap::default();
    for &gid in &module.globals {
        let gv = prog.global(gid);
        for tm in &gv.type_metadata {
            type_id_map.entry(tm.type_id.as_str()).or_default().push((gv, tm.offset));
        }
    }
    if type_id_map.is_empty() {
        return result;
    }

    for ((type_id, byte_offset), sites) in slots {
        let Some(members) = type_id_map.get(type_id.as_str()) else { continue };
        let Some(targets) = try_find_targets(prog, members, byte_offset) else { continue };
        for site in sites {
            result.add(site, &targets);
        }
    }
    result
}

/// Extract the slot's targets from every member vtable, or give up on the
/// whole slot when any member is not a readable constant.
fn try_find_targets(
    prog: &Program,
    members: &[(&crate::ir::GlobalVariable, u64)],
    byte_offset: u64,
) -> Option<Vec<FuncId>> {
    let mut targets = Vec::new();
    for (gv, base) in members {
        if !gv.is_constant {
            return None;
        }
        let init = gv.init.as_ref()?;
        let entry = constant_at_offset(&prog.types, init, base + byte_offset)?;
        let f = entry.as_function()?;
        // Calls to pure virtuals are UB; the sentinel is not a real target.
        if prog.func(f).name == PURE_VIRTUAL {
            continue;
        }
        trace!(target = %prog.func(f).name, vtable = %gv.name, "vtable slot target");
        targets.push(f);
    }
    if targets.is_empty() { None } else { Some(targets) }
}

/// Find `llvm.assume(llvm.type.test(ptr, !id))` patterns in `func` and group
/// the indirect calls loading through `ptr` by `(type id, byte offset)`.
fn scan_type_test_users(
    prog: &Program,
    fid: FuncId,
    func: &Function,
    slots: &mut FxHashMap<(String, u64), Vec<(FuncId, InstId)>>,
) {
    for (i, inst) in func.insts.iter().enumerate() {
        let InstKind::Call { callee: Callee::Direct(cf), args, .. } = &inst.kind else {
            continue;
        };
        if prog.func(*cf).name != TYPE_TEST || args.len() < 2 {
            continue;
        }
        let test_result = Operand::Inst(InstId::new(i as u32));
        if !flows_into_assume(prog, func, &test_result) {
            continue;
        }
        let vtable_ptr = &args[0];
        let Some(Constant::Metadata(type_id)) = constant_of(&args[1]) else { continue };

        for (j, candidate) in func.insts.iter().enumerate() {
            let InstKind::Call { callee: Callee::Indirect(cv), .. } = &candidate.kind else {
                continue;
            };
            if let Some(offset) = vtable_load_offset(prog, func, cv, vtable_ptr) {
                trace!(type_id = %type_id, offset, "virtual call site");
                slots
                    .entry((type_id.clone(), offset))
                    .or_default()
                    .push((fid, InstId::new(j as u32)));
            }
        }
    }
}

fn constant_of(op: &Operand) -> Option<&Constant> {
    match op {
        Operand::Const(c) => Some(c),
        _ => None,
    }
}

fn flows_into_assume(prog: &Program, func: &Function, value: &Operand) -> bool {
    func.insts.iter().any(|inst| match &inst.kind {
        InstKind::Call { callee: Callee::Direct(cf), args, .. } => {
            prog.func(*cf).name == ASSUME && args.first() == Some(value)
        }
        _ => false,
    })
}

/// When `called` is a load of `vtable_ptr + constant offset`, return that
/// byte offset.
fn vtable_load_offset(
    prog: &Program,
    func: &Function,
    called: &Operand,
    vtable_ptr: &Operand,
) -> Option<u64> {
    let Stripped::Inst(_, load) = strip_operand(func, called) else { return None };
    let InstKind::Load { ptr: slot } = &load.kind else { return None };
    if same_value(func, slot, vtable_ptr) {
        return Some(0);
    }
    let Stripped::Inst(_, gep) = strip_operand(func, slot) else { return None };
    let InstKind::Gep { ptr, source_ty, indices } = &gep.kind else { return None };
    if !same_value(func, ptr, vtable_ptr) {
        return None;
    }
    let consts: Option<Vec<i64>> = indices.iter().map(GepIndex::as_const).collect();
    gep_byte_offset(&prog.types, *source_ty, &consts?)
}

/// Two operands denote the same value after cast stripping.
fn same_value(func: &Function, a: &Operand, b: &Operand) -> bool {
    match (strip_operand(func, a), strip_operand(func, b)) {
        (Stripped::Inst(ia, _), Stripped::Inst(ib, _)) => ia == ib,
        (Stripped::Arg(na), Stripped::Arg(nb)) => na == nb,
        (Stripped::Const(ca), Stripped::Const(cb)) => ca == cb,
        _ => false,
    }
}

/// Byte offset of a constant-index GEP under the default data layout.
fn gep_byte_offset(types: &TypeArena, source_ty: TypeId, indices: &[i64]) -> Option<u64> {
    let first = *indices.first()?;
    let mut offset = i128::from(first) * i128::from(types.alloc_size(source_ty));
    let mut ty = source_ty;
    for &idx in &indices[1..] {
        match types.kind(ty) {
            crate::ir::TypeKind::Struct { fields, .. } => {
                let idx = usize::try_from(idx).ok()?;
                for &f in fields.get(..idx)? {
                    offset += i128::from(types.alloc_size(f));
                }
                ty = *fields.get(idx)?;
            }
            crate::ir::TypeKind::Array { element, .. }
            | crate::ir::TypeKind::Vector { element, .. } => {
                offset += i128::from(idx) * i128::from(types.alloc_size(*element));
                ty = *element;
            }
            _ => return None,
        }
    }
    u64::try_from(offset).ok()
}

/// The pointer-sized constant found at `offset` bytes into a constant
/// initializer, descending through nested aggregates.
fn constant_at_offset<'a>(
    types: &TypeArena,
    init: &'a Constant,
    offset: u64,
) -> Option<&'a Constant> {
    let c = init.strip_casts();
    if let Constant::Aggregate { ty, elements } = c {
        match types.kind(*ty) {
            crate::ir::TypeKind::Struct { fields, .. } => {
                let mut acc = 0u64;
                for (i, &f) in fields.iter().enumerate() {
                    let size = types.alloc_size(f);
                    if offset < acc + size {
                        return constant_at_offset(types, elements.get(i)?, offset - acc);
                    }
                    acc += size;
                }
                None
            }
            crate::ir::TypeKind::Array { element, .. }
            | crate::ir::TypeKind::Vector { element, .. } => {
                let esize = types.alloc_size(*element);
                if esize == 0 {
                    return None;
                }
                let idx = usize::try_from(offset / esize).ok()?;
                constant_at_offset(types, elements.get(idx)?, offset % esize)
            }
            _ => None,
        }
    } else if offset == 0 {
        Some(c)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{Linkage, Program, TypeKind};

    /// One class, two-entry vtable; the call loads slot 1 (byte offset 8),
    /// whose target is `draw`.
    #[test]
    fn slot_targets_come_from_the_constant_vtable() {
        let mut prog = Program::new();
        let void = prog.types.void();
        let i1 = prog.types.int(1);
        let i8p = prog.types.i8_ptr();
        let i8pp = prog.types.pointer(i8p);
        let i8ppp = prog.types.pointer(i8pp);
        let metadata = prog.types.intern(TypeKind::Metadata);
        let vt_arr = prog.types.array(i8p, 2);
        let vt_ty = prog.types.anon_struct(&[vt_arr]);
        let method_fty = prog.types.function(void, &[i8p], false);
        let method_ptr = prog.types.pointer(method_fty);
        let tt_fty = prog.types.function(i1, &[i8p, metadata], false);
        let assume_fty = prog.types.function(void, &[i1], false);
        let main_fty = prog.types.function(void, &[i8ppp], false);

        let mut mb = ModuleBuilder::new(&mut prog, "linked.bc", "prog.cpp");
        let dtor = mb.define_function("_ZN6WidgetD1Ev", method_fty, Linkage::External);
        let draw = mb.define_function("_ZN6Widget4drawEv", method_fty, Linkage::External);
        let type_test = mb.declare_function(TYPE_TEST, tt_fty, Linkage::External);
        let assume = mb.declare_function(ASSUME, assume_fty, Linkage::External);

        let dtor_cast = mb.const_bitcast(Constant::Function(dtor), i8p);
        let draw_cast = mb.const_bitcast(Constant::Function(draw), i8p);
        let vt_init = Constant::Aggregate {
            ty: vt_ty,
            elements: vec![Constant::Aggregate {
                ty: vt_arr,
                elements: vec![dtor_cast, draw_cast],
            }],
        };
        let vt = mb.add_global("_ZTV6Widget", vt_ty, Some(vt_init));
        mb.set_global_constant(vt);
        mb.add_global_type_metadata(vt, "_ZTS6Widget", 0);

        let caller = mb.define_function("call_draw", main_fty, Linkage::External);
        let module = mb.module_id();
        let mut b = mb.body(caller);
        let vtable = b.load(Operand::Arg(0));
        let vtable_i8 = b.bitcast(vtable.clone(), i8p);
        let test = b.call_direct(
            type_test,
            vec![vtable_i8, Operand::Const(Constant::Metadata("_ZTS6Widget".into()))],
        );
        b.call_direct(assume, vec![test]);
        let slot = b.gep(i8p, vtable, &[1]);
        let fp = b.load(slot);
        let fp_typed = b.bitcast(fp, method_ptr);
        let this = b.null(i8p);
        b.call_indirect(method_fty, fp_typed, vec![this]);
        drop(mb);

        let result = resolve_virtual_calls(&prog, module);
        assert!(!result.is_empty());
        let site = InstId::new(prog.func(caller).insts.len() as u32 - 1);
        let targets = result.get(caller, site).expect("virtual site resolved");
        assert!(targets.contains(&draw));
        assert!(!targets.contains(&dtor));
    }

    /// A vtable that is not a constant makes the whole slot unresolvable.
    #[test]
    fn non_constant_vtable_gives_up_the_slot() {
        let mut prog = Program::new();
        let void = prog.types.void();
        let i1 = prog.types.int(1);
        let i8p = prog.types.i8_ptr();
        let i8pp = prog.types.pointer(i8p);
        let i8ppp = prog.types.pointer(i8pp);
        let metadata = prog.types.intern(TypeKind::Metadata);
        let vt_arr = prog.types.array(i8p, 1);
        let vt_ty = prog.types.anon_struct(&[vt_arr]);
        let method_fty = prog.types.function(void, &[i8p], false);
        let tt_fty = prog.types.function(i1, &[i8p, metadata], false);
        let assume_fty = prog.types.function(void, &[i1], false);
        let main_fty = prog.types.function(void, &[i8ppp], false);

        let mut mb = ModuleBuilder::new(&mut prog, "linked.bc", "prog.cpp");
        let dtor = mb.define_function("_ZN6WidgetD1Ev", method_fty, Linkage::External);
        let type_test = mb.declare_function(TYPE_TEST, tt_fty, Linkage::External);
        let assume = mb.declare_function(ASSUME, assume_fty, Linkage::External);
        let dtor_cast = mb.const_bitcast(Constant::Function(dtor), i8p);
        let vt_init = Constant::Aggregate {
            ty: vt_ty,
            elements: vec![Constant::Aggregate { ty: vt_arr, elements: vec![dtor_cast] }],
        };
        // Writable vtable: targets cannot be trusted.
        let vt = mb.add_global("_ZTV6Widget", vt_ty, Some(vt_init));
        mb.add_global_type_metadata(vt, "_ZTS6Widget", 0);

        let caller = mb.define_function("call_it", main_fty, Linkage::External);
        let module = mb.module_id();
        let mut b = mb.body(caller);
        let vtable = b.load(Operand::Arg(0));
        let test = b.call_direct(
            type_test,
            vec![vtable.clone(), Operand::Const(Constant::Metadata("_ZTS6Widget".into()))],
        );
        b.call_direct(assume, vec![test]);
        let fp = b.load(vtable);
        let this = b.null(i8p);
        b.call_indirect(method_fty, fp, vec![this]);
        drop(mb);

        let result = resolve_virtual_calls(&prog, module);
        assert!(result.is_empty());
    }
}
