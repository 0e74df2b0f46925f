//! The fact base: every relation the resolvers query, and the per-module
//! initialization sweep that populates it.
//!
//! All relations grow monotonically; nothing is erased during an analysis
//! run. [`TypeFacts::build_module`] reports whether it learned anything new,
//! which is what lets the driver iterate modules to a fixpoint regardless of
//! load order.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::ir::{
    Callee, Constant, FuncId, Function, GepIndex, InstKind, Linkage, ModuleId, Operand, Program,
    Stripped, TypeId, strip_operand,
};

use super::fingerprint::{func_hash, func_hash_with_receiver, type_hash, type_idx_hash};
use super::layers::LayerWalker;

pub type FuncSet = FxHashSet<FuncId>;

/// The whole analysis state. One instance is built over every module before
/// resolution starts; the resolvers only ever read it.
#[derive(Debug, Default)]
pub struct TypeFacts {
    /// `(type, field index)` hash → functions that field may hold.
    pub type_funcs: FxHashMap<u64, FuncSet>,
    /// Outer type hash → hashes of composite types assigned into its fields.
    pub type_confine: FxHashMap<u64, FxHashSet<u64>>,
    /// Cast-target type hash → cast-source type hashes.
    pub type_transit: FxHashMap<u64, FxHashSet<u64>>,
    /// Types and fields a function pointer escaped through.
    pub type_escape: FxHashSet<u64>,
    /// Struct name → struct types carrying that name.
    pub struct_types: FxHashMap<String, FxHashSet<TypeId>>,
    /// Cast-source type hash → cast-target types (feeds the C++ receiver
    /// signatures).
    pub transit_types: FxHashMap<u64, FxHashSet<TypeId>>,
    /// Nameless signature hash → address-taken functions carrying it.
    pub sig_funcs: FxHashMap<u64, FuncSet>,
    /// Functions whose address is observable.
    pub address_taken: FuncSet,
    /// Named signature hash → canonical representative.
    pub unified: FxHashMap<u64, FuncId>,
    /// Externally-linked definitions by symbol name.
    pub global_funcs: FxHashMap<String, FuncId>,
    changed: bool,
}

impl TypeFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the externally-linked definition over a local declaration of
    /// the same symbol.
    pub fn resolve(&self, prog: &Program, f: FuncId) -> FuncId {
        let func = prog.func(f);
        if func.is_declaration {
            if let Some(&def) = self.global_funcs.get(&func.name) {
                return def;
            }
        }
        f
    }

    /// The canonical representative for a function (deduplicates inlined
    /// copies that share the named signature hash).
    pub fn unified_for(&self, prog: &Program, f: FuncId) -> FuncId {
        self.unified.get(&func_hash(prog, f, true)).copied().unwrap_or(f)
    }

    /// Sweep one module's globals and instructions into the fact base.
    /// Returns true when any relation grew.
    pub fn build_module(&mut self, prog: &Program, mid: ModuleId) -> bool {
        self.changed = false;
        let module = prog.module(mid);
        trace!(module = %module.name, "building type facts");

        for (name, id) in prog.types.named_structs() {
            if self.struct_types.entry(name.to_string()).or_default().insert(id) {
                self.changed = true;
            }
        }

        for &gid in &module.globals {
            let gv = prog.global(gid);
            if let Some(init) = &gv.init {
                self.confine_in_global_init(prog, init);
                self.scan_constant(prog, init);
                if matches!(init, Constant::Aggregate { .. }) {
                    self.confine_in_initializer(prog, init);
                }
            }
        }

        for &fid in &module.functions {
            let func = prog.func(fid);
            if func.is_declaration {
                continue;
            }
            for inst in &func.insts {
                match &inst.kind {
                    InstKind::Store { ptr, value } => {
                        self.confine_in_store(prog, func, ptr, value);
                    }
                    InstKind::Cast { value, .. } => {
                        self.confine_in_cast(prog, func, value, inst.ty);
                    }
                    InstKind::Call { callee: Callee::Direct(cf), args, .. } => {
                        // Aggregate copies through memory intrinsics behave
                        // like a store of the source into the destination.
                        let callee = prog.func(*cf);
                        if (callee.name.starts_with("llvm.memcpy")
                            || callee.name.starts_with("llvm.memmove"))
                            && args.len() >= 2
                        {
                            self.confine_in_store(prog, func, &args[0], &args[1]);
                        }
                    }
                    _ => {}
                }
                self.scan_inst_operands(prog, inst);
            }
            if func.linkage == Linkage::External && !self.global_funcs.contains_key(&func.name) {
                self.global_funcs.insert(func.name.clone(), fid);
                self.changed = true;
            }
            let nh = func_hash(prog, fid, true);
            if !self.unified.contains_key(&nh) {
                self.unified.insert(nh, fid);
                self.changed = true;
            }
        }

        self.refresh_receiver_signatures(prog);
        self.changed
    }

    /// Walk a composite initializer, recording function constants against
    /// every `(type, index)` slot and every enclosing composite seen so far.
    fn confine_in_initializer(&mut self, prog: &Program, init: &Constant) {
        let types = &prog.types;
        let mut worklist: Vec<&Constant> = vec![init];
        let mut enclosing: FxHashSet<u64> = FxHashSet::default();

        while let Some(u) = worklist.pop() {
            let Constant::Aggregate { ty: u_ty, elements } = u else {
                continue;
            };
            for (n, o) in elements.iter().enumerate() {
                let o = o.strip_casts();
                if let Some(f) = o.as_function() {
                    let f = self.resolve(prog, f);
                    trace!(func = %prog.func(f).name, idx = n, "function constant in initializer");
                    self.insert_type_func(type_idx_hash(types, *u_ty, n as i64), f);
                    for &h in &enclosing {
                        self.insert_type_func(h, f);
                    }
                    continue;
                }
                let Some(o_ty) = o.ty(prog) else { continue };
                if types.is_composite(o_ty) {
                    enclosing.insert(type_idx_hash(types, *u_ty, n as i64));
                    if matches!(o, Constant::Aggregate { .. }) {
                        worklist.push(o);
                    }
                }
                // A pointer operand is left to the pointee's own initializer.
            }
        }
    }

    /// Apply the store rules to `*dst = value`.
    fn confine_in_store(&mut self, prog: &Program, func: &Function, dst: &Operand, value: &Operand) {
        let types = &prog.types;

        // A function constant lands in every layer of the destination.
        if let Stripped::Const(c) = strip_operand(func, value) {
            if let Some(f) = c.as_function() {
                let f = self.resolve(prog, f);
                for layer in LayerWalker::new(prog, func, dst) {
                    trace!(func = %prog.func(f).name, idx = layer.idx, "function stored into field");
                    self.insert_type_func(type_idx_hash(types, layer.ty, layer.idx), f);
                }
                return;
            }
            if c.is_null() {
                return;
            }
        }

        let Some(src_ty) = stripped_type(prog, func, value) else { return };
        let Some(pointee) = types.pointee(src_ty) else { return };
        let Some(layer) = LayerWalker::new(prog, func, dst).next() else { return };

        if types.is_composite(pointee) {
            self.insert_confine(type_hash(types, layer.ty), type_hash(types, pointee));
        } else {
            // A value we cannot attribute to a (type, index) slot entered
            // this field; the slot can no longer be trusted.
            self.escape_type(prog, layer.ty, layer.idx);
        }
    }

    /// Record transit edges for a cast instruction.
    fn confine_in_cast(&mut self, prog: &Program, func: &Function, value: &Operand, to_ty: TypeId) {
        let types = &prog.types;
        let Some(from_ty) = prog.operand_type(func, value) else { return };

        if types.is_composite(from_ty) {
            self.insert_transit(type_hash(types, to_ty), type_hash(types, from_ty));
            return;
        }
        if !types.is_pointer(from_ty) || !types.is_pointer(to_ty) {
            return;
        }
        let eto = types.ultimate_pointee(to_ty);
        let efrom = types.ultimate_pointee(from_ty);
        if types.is_composite(eto) && types.is_composite(efrom) {
            self.insert_transit_type(type_hash(types, efrom), eto);
            self.insert_transit(type_hash(types, eto), type_hash(types, efrom));
        }
    }

    /// A global pointer initialized (through a cast) with another global that
    /// debug info identifies as a C++ class instance: connect the class's
    /// struct types to the pointer's pointee.
    fn confine_in_global_init(&mut self, prog: &Program, init: &Constant) {
        let types = &prog.types;
        let (Some(init_ty), Some(stripped_ty)) = (init.ty(prog), init.strip_casts().ty(prog))
        else {
            return;
        };
        let from_ty = types.ultimate_pointee(stripped_ty);
        let to_ty = types.ultimate_pointee(init_ty);
        if from_ty == to_ty {
            return;
        }
        let Constant::BitCast { value, .. } = init else { return };
        let Constant::Global(g) = value.as_ref() else { return };
        let Some(class) = &prog.global(*g).debug_class else { return };
        let ty_name = format!("class.{class}");
        let Some(sources) = self.struct_types.get(&ty_name) else { return };
        let sources: Vec<TypeId> = sources.iter().copied().collect();
        for src in sources {
            self.insert_transit_type(type_hash(types, src), to_ty);
        }
    }

    /// Mark a function address-taken and index it by its nameless signature.
    fn add_address_taken(&mut self, prog: &Program, f: FuncId) {
        if prog.func(f).is_intrinsic() {
            return;
        }
        if !self.address_taken.insert(f) {
            return;
        }
        self.changed = true;
        trace!(func = %prog.func(f).name, "address taken");
        self.insert_sig(func_hash(prog, f, false), f);
    }

    /// For address-taken functions whose first parameter is a struct with
    /// recorded cast targets, also index them under the signature obtained by
    /// substituting the target struct. This is what catches a C++ override
    /// whose `this` type differs from the base method's. Idempotent; rerun
    /// each sweep so late transit facts still land.
    fn refresh_receiver_signatures(&mut self, prog: &Program) {
        let types = &prog.types;
        let snapshot: Vec<FuncId> = self.address_taken.iter().copied().collect();
        for f in snapshot {
            let Some(&first) = prog.func(f).params(types).first() else { continue };
            let arg_ty = types.ultimate_pointee(first);
            if !types.is_struct(arg_ty) {
                continue;
            }
            let Some(targets) = self.transit_types.get(&type_hash(types, arg_ty)) else {
                continue;
            };
            let targets: Vec<TypeId> = targets.iter().copied().collect();
            for t in targets {
                if types.is_struct(t) {
                    self.insert_sig(func_hash_with_receiver(prog, f, t), f);
                }
            }
        }
    }

    fn escape_type(&mut self, prog: &Program, ty: TypeId, idx: i64) {
        let types = &prog.types;
        let h = if idx == -1 {
            type_hash(types, ty)
        } else {
            type_idx_hash(types, ty, idx)
        };
        if self.type_escape.insert(h) {
            trace!(ty = %types.print(ty), idx, "type escaped");
            self.changed = true;
        }
    }

    /// Recursively mark every function referenced by a constant.
    fn scan_constant(&mut self, prog: &Program, c: &Constant) {
        match c {
            Constant::Function(f) => {
                let f = self.resolve(prog, *f);
                self.add_address_taken(prog, f);
            }
            Constant::Aggregate { elements, .. } => {
                for e in elements {
                    self.scan_constant(prog, e);
                }
            }
            Constant::BitCast { value, .. } => self.scan_constant(prog, value),
            Constant::Gep { base, .. } => self.scan_constant(prog, base),
            _ => {}
        }
    }

    /// Mark address-taken functions appearing in instruction operands. The
    /// callee position of a call does not count: a direct call is not an
    /// address-taking use, and an indirect callee that strips to a function
    /// constant is handled as a direct call by the dispatcher.
    fn scan_inst_operands(&mut self, prog: &Program, inst: &crate::ir::Inst) {
        let mut scan = |op: &Operand| {
            if let Operand::Const(c) = op {
                self.scan_constant(prog, c);
            }
        };
        match &inst.kind {
            InstKind::Load { ptr } => scan(ptr),
            InstKind::Store { ptr, value } => {
                scan(ptr);
                scan(value);
            }
            InstKind::Gep { ptr, indices, .. } => {
                scan(ptr);
                for idx in indices {
                    if let GepIndex::Dynamic(op) = idx {
                        scan(op);
                    }
                }
            }
            InstKind::Cast { value, .. } => scan(value),
            InstKind::Call { args, .. } => {
                for arg in args {
                    scan(arg);
                }
            }
            InstKind::Ret { value } => {
                if let Some(op) = value {
                    scan(op);
                }
            }
            InstKind::Other { operands } => {
                for op in operands {
                    scan(op);
                }
            }
            InstKind::Alloca { .. } => {}
        }
    }

    fn insert_type_func(&mut self, h: u64, f: FuncId) {
        if self.type_funcs.entry(h).or_default().insert(f) {
            self.changed = true;
        }
    }

    fn insert_sig(&mut self, h: u64, f: FuncId) {
        if self.sig_funcs.entry(h).or_default().insert(f) {
            self.changed = true;
        }
    }

    fn insert_confine(&mut self, outer: u64, inner: u64) {
        if self.type_confine.entry(outer).or_default().insert(inner) {
            self.changed = true;
        }
    }

    fn insert_transit(&mut self, to: u64, from: u64) {
        if self.type_transit.entry(to).or_default().insert(from) {
            self.changed = true;
        }
    }

    fn insert_transit_type(&mut self, from: u64, to: TypeId) {
        if self.transit_types.entry(from).or_default().insert(to) {
            self.changed = true;
        }
    }
}

/// The type of an operand after cast stripping.
fn stripped_type(prog: &Program, func: &Function, op: &Operand) -> Option<TypeId> {
    match strip_operand(func, op) {
        Stripped::Inst(_, inst) => Some(inst.ty),
        Stripped::Arg(n) => func.params(&prog.types).get(n as usize).copied(),
        Stripped::Const(c) => c.ty(prog),
    }
}
