//! LLVM bitcode loader: adapts `llvm-ir` modules into the owned IR.
//!
//! Only available with the `llvm-loader` feature, since `llvm-ir` links
//! against an installed LLVM. The adaptation is deliberately partial where
//! `llvm-ir` does not surface the information: inlining chains, `!type`
//! vtable annotations and DWARF class names of globals are not exposed by
//! the crate, so rows from this loader carry no inlined-from fields and the
//! vtable pass sees no type metadata.

use std::path::Path;

use llvm_ir::debugloc::HasDebugLoc;
use llvm_ir::types::Typed;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::builder::ModuleBuilder;
use crate::ir::{
    Callee, CastOp, Constant, DebugLoc, FuncId, GepIndex, GlobalId, Inst, InstId, InstKind,
    Linkage, ModuleId, Operand, Program, TypeId,
};

use super::LoadError;

pub fn load(prog: &mut Program, path: &Path) -> Result<Vec<ModuleId>, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parsed = if ext == "ll" {
        llvm_ir::Module::from_ir_path(path)
    } else {
        llvm_ir::Module::from_bc_path(path)
    };
    let module = parsed
        .map_err(|message| LoadError::Parse { path: path.to_path_buf(), message })?;

    let mut tr = Translator {
        mb: ModuleBuilder::new(prog, path.display().to_string(), module.source_file_name.clone()),
        module: &module,
        types: FxHashMap::default(),
        structs_in_progress: FxHashSet::default(),
        functions: FxHashMap::default(),
        globals: FxHashMap::default(),
    };
    let mid = tr.run();
    Ok(vec![mid])
}

struct Translator<'m, 'p> {
    mb: ModuleBuilder<'p>,
    module: &'m llvm_ir::Module,
    types: FxHashMap<llvm_ir::TypeRef, TypeId>,
    structs_in_progress: FxHashSet<String>,
    functions: FxHashMap<String, FuncId>,
    globals: FxHashMap<String, GlobalId>,
}

impl Translator<'_, '_> {
    fn run(&mut self) -> ModuleId {
        let mid = self.mb.module_id();
        // llvm-ir does not expose named metadata; assume debug info is
        // present when any function carries a location.
        if !self.module.functions.iter().any(|f| f.get_debug_loc().is_some()) {
            self.mb.mark_no_debug_info();
        }

        // Every global and function first, so constants can reference them.
        for gv in &self.module.global_vars {
            let mapped = self.map_type(&gv.ty);
            let pointee = mapped.and_then(|t| self.mb.types().pointee(t));
            let value_ty = match pointee {
                Some(t) => t,
                None => self.mb.types().void(),
            };
            let gid = self.mb.add_global(name_str(&gv.name), value_ty, None);
            if gv.is_constant {
                self.mb.set_global_constant(gid);
            }
            self.globals.insert(name_str(&gv.name), gid);
        }
        for f in &self.module.functions {
            let fid = self.declare(f);
            self.functions.insert(f.name.clone(), fid);
        }

        for gv in &self.module.global_vars {
            if let Some(init) = &gv.initializer {
                let init = self.map_constant(init);
                if let Some(&gid) = self.globals.get(&name_str(&gv.name)) {
                    self.mb.set_global_init(gid, init);
                }
            }
        }

        for f in &self.module.functions {
            if let Some(&fid) = self.functions.get(&f.name) {
                self.translate_body(fid, f);
            }
        }
        mid
    }

    fn declare(&mut self, f: &llvm_ir::Function) -> FuncId {
        let ret = self.map_type_or_void(&f.return_type);
        let params: Vec<TypeId> =
            f.parameters.iter().map(|p| self.map_type_or_void(&p.ty)).collect();
        let fty = self.mb.types().function(ret, &params, f.is_var_arg);
        let linkage = match f.linkage {
            llvm_ir::module::Linkage::Internal | llvm_ir::module::Linkage::Private => {
                Linkage::Internal
            }
            _ => Linkage::External,
        };
        let is_definition = !f.basic_blocks.is_empty();
        let fid = if is_definition {
            self.mb.define_function(&f.name, fty, linkage)
        } else {
            self.mb.declare_function(&f.name, fty, linkage)
        };
        if let Some(loc) = f.get_debug_loc() {
            self.mb.set_subprogram(fid, &f.name, &loc.filename, loc.line);
        }
        fid
    }

    /// A function referenced by constants but not defined here (intrinsics,
    /// libc): declare it lazily.
    fn external_function(&mut self, name: &str, fty: TypeId) -> FuncId {
        if let Some(&fid) = self.functions.get(name) {
            return fid;
        }
        let fid = self.mb.declare_function(name, fty, Linkage::External);
        self.functions.insert(name.to_string(), fid);
        fid
    }

    fn external_global(&mut self, name: &str, value_ty: TypeId) -> GlobalId {
        if let Some(&gid) = self.globals.get(name) {
            return gid;
        }
        let gid = self.mb.add_global(name, value_ty, None);
        self.globals.insert(name.to_string(), gid);
        gid
    }

    fn map_type_or_void(&mut self, t: &llvm_ir::TypeRef) -> TypeId {
        self.map_type(t).unwrap_or_else(|| self.mb.types().void())
    }

    fn map_type(&mut self, t: &llvm_ir::TypeRef) -> Option<TypeId> {
        if let Some(&mapped) = self.types.get(t) {
            return Some(mapped);
        }
        use llvm_ir::Type;
        let mapped = match t.as_ref() {
            Type::VoidType => self.mb.types().void(),
            Type::IntegerType { bits } => self.mb.types().int(*bits),
            Type::FPType(fp) => {
                let bits = match fp {
                    llvm_ir::types::FPType::Half | llvm_ir::types::FPType::BFloat => 16,
                    llvm_ir::types::FPType::Single => 32,
                    llvm_ir::types::FPType::Double => 64,
                    llvm_ir::types::FPType::X86_FP80 => 80,
                    llvm_ir::types::FPType::FP128 | llvm_ir::types::FPType::PPC_FP128 => 128,
                };
                self.mb.types().float(bits)
            }
            Type::PointerType { pointee_type, .. } => {
                let p = self.map_type_or_void(pointee_type);
                self.mb.types().pointer(p)
            }
            Type::ArrayType { element_type, num_elements } => {
                let e = self.map_type_or_void(element_type);
                self.mb.types().array(e, *num_elements as u64)
            }
            Type::VectorType { element_type, num_elements, .. } => {
                let e = self.map_type_or_void(element_type);
                self.mb.types().vector(e, *num_elements as u64)
            }
            Type::StructType { element_types, .. } => {
                let fields: Vec<TypeId> =
                    element_types.iter().map(|e| self.map_type_or_void(e)).collect();
                self.mb.types().anon_struct(&fields)
            }
            Type::NamedStructType { name } => self.named_struct(name),
            Type::FuncType { result_type, param_types, is_var_arg } => {
                let ret = self.map_type_or_void(result_type);
                let params: Vec<TypeId> =
                    param_types.iter().map(|p| self.map_type_or_void(p)).collect();
                self.mb.types().function(ret, &params, *is_var_arg)
            }
            Type::MetadataType => self.mb.types().intern(crate::ir::TypeKind::Metadata),
            _ => return None,
        };
        self.types.insert(t.clone(), mapped);
        Some(mapped)
    }

    fn named_struct(&mut self, name: &str) -> TypeId {
        let id = self.mb.types().declare_struct(name);
        if self.structs_in_progress.contains(name) {
            return id;
        }
        self.structs_in_progress.insert(name.to_string());
        if let Some(llvm_ir::types::NamedStructDef::Defined(body)) =
            self.module.types.named_struct_def(name)
        {
            let body = body.clone();
            if let llvm_ir::Type::StructType { element_types, .. } = body.as_ref() {
                let fields: Vec<TypeId> =
                    element_types.iter().map(|e| self.map_type_or_void(e)).collect();
                let types = self.mb.types();
                types.define_struct(id, fields);
            }
        }
        id
    }

    fn map_constant(&mut self, c: &llvm_ir::ConstantRef) -> Constant {
        use llvm_ir::Constant as C;
        match c.as_ref() {
            C::Int { bits, value } => {
                let ty = self.mb.types().int(*bits);
                Constant::Int { ty, value: *value as i64 }
            }
            C::Null(t) => {
                let ty = self.map_type_or_void(t);
                Constant::Null { ty }
            }
            C::AggregateZero(t) | C::Undef(t) => {
                let ty = self.map_type_or_void(t);
                Constant::Zero { ty }
            }
            C::Struct { name, values, .. } => {
                let elements: Vec<Constant> = values.iter().map(|v| self.map_constant(v)).collect();
                let ty = match name {
                    Some(n) => self.named_struct(n),
                    None => {
                        let field_types: Vec<TypeId> = values
                            .iter()
                            .map(|v| {
                                let t = self.module.types.type_of(v);
                                self.map_type_or_void(&t)
                            })
                            .collect();
                        self.mb.types().anon_struct(&field_types)
                    }
                };
                Constant::Aggregate { ty, elements }
            }
            C::Array { element_type, elements } => {
                let e = self.map_type_or_void(element_type);
                let ty = self.mb.types().array(e, elements.len() as u64);
                let elements: Vec<Constant> =
                    elements.iter().map(|v| self.map_constant(v)).collect();
                Constant::Aggregate { ty, elements }
            }
            C::Vector(elements) => {
                let e = elements
                    .first()
                    .map(|v| {
                        let t = self.module.types.type_of(v);
                        self.map_type_or_void(&t)
                    })
                    .unwrap_or_else(|| self.mb.types().void());
                let ty = self.mb.types().vector(e, elements.len() as u64);
                let elements: Vec<Constant> =
                    elements.iter().map(|v| self.map_constant(v)).collect();
                Constant::Aggregate { ty, elements }
            }
            C::GlobalReference { name, ty } => {
                let mapped = self.map_type_or_void(ty);
                if matches!(ty.as_ref(), llvm_ir::Type::FuncType { .. }) {
                    Constant::Function(self.external_function(&name_str(name), mapped))
                } else {
                    Constant::Global(self.external_global(&name_str(name), mapped))
                }
            }
            C::BitCast(cast) => {
                let ty = self.map_type_or_void(&cast.to_type);
                Constant::BitCast { ty, value: Box::new(self.map_constant(&cast.operand)) }
            }
            C::GetElementPtr(gep) => {
                let base = self.map_constant(&gep.address);
                let base_ty = {
                    let t = self.module.types.type_of(&gep.address);
                    self.map_type_or_void(&t)
                };
                let source_ty = self
                    .mb
                    .types()
                    .pointee(base_ty)
                    .unwrap_or_else(|| self.mb.types().void());
                let indices: Option<Vec<i64>> = gep
                    .indices
                    .iter()
                    .map(|i| match i.as_ref() {
                        C::Int { value, .. } => Some(*value as i64),
                        _ => None,
                    })
                    .collect();
                match indices {
                    Some(indices) => self.mb.const_gep(source_ty, base, &indices),
                    None => base,
                }
            }
            other => {
                let t = self.module.types.type_of(c);
                let ty = self.map_type_or_void(&t);
                let _ = other;
                Constant::Zero { ty }
            }
        }
    }

    fn translate_body(&mut self, fid: FuncId, f: &llvm_ir::Function) {
        // Pre-assign result slots so forward references (phis) resolve.
        let mut locals: FxHashMap<String, InstId> = FxHashMap::default();
        let mut next = 0u32;
        for bb in &f.basic_blocks {
            for instr in &bb.instrs {
                if let Some(dest) = instr.try_get_result() {
                    locals.insert(name_str(dest), InstId::new(next));
                }
                next += 1;
            }
            next += 1; // terminator slot
        }
        let params: FxHashMap<String, u32> = f
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (name_str(&p.name), i as u32))
            .collect();

        for bb in &f.basic_blocks {
            for instr in &bb.instrs {
                let inst = self.translate_inst(instr, &locals, &params);
                self.push_raw(fid, inst);
            }
            let term = self.translate_terminator(&bb.term, &locals, &params);
            self.push_raw(fid, term);
        }
    }

    fn push_raw(&mut self, fid: FuncId, inst: Inst) {
        self.mb.program().functions[fid.index()].insts.push(inst);
    }

    fn operand(
        &mut self,
        op: &llvm_ir::Operand,
        locals: &FxHashMap<String, InstId>,
        params: &FxHashMap<String, u32>,
    ) -> Operand {
        match op {
            llvm_ir::Operand::LocalOperand { name, ty } => {
                let key = name_str(name);
                if let Some(&id) = locals.get(&key) {
                    Operand::Inst(id)
                } else if let Some(&n) = params.get(&key) {
                    Operand::Arg(n)
                } else {
                    let ty = self.map_type_or_void(ty);
                    Operand::Const(Constant::Zero { ty })
                }
            }
            llvm_ir::Operand::ConstantOperand(c) => Operand::Const(self.map_constant(c)),
            llvm_ir::Operand::MetadataOperand => {
                Operand::Const(Constant::Metadata(String::new()))
            }
        }
    }

    fn result_type(&mut self, instr: &llvm_ir::Instruction) -> TypeId {
        let t = self.module.types.type_of(instr);
        self.map_type_or_void(&t)
    }

    fn debug_of(&self, has: &dyn HasDebugLoc) -> Option<DebugLoc> {
        has.get_debug_loc().as_ref().map(|loc| DebugLoc::new(loc.filename.clone(), loc.line))
    }

    fn translate_inst(
        &mut self,
        instr: &llvm_ir::Instruction,
        locals: &FxHashMap<String, InstId>,
        params: &FxHashMap<String, u32>,
    ) -> Inst {
        use llvm_ir::Instruction as I;
        let debug = self.debug_of(instr);
        let ty = self.result_type(instr);
        let kind = match instr {
            I::Alloca(a) => {
                let allocated = self.map_type_or_void(&a.allocated_type);
                InstKind::Alloca { allocated }
            }
            I::Load(l) => InstKind::Load { ptr: self.operand(&l.address, locals, params) },
            I::Store(s) => InstKind::Store {
                ptr: self.operand(&s.address, locals, params),
                value: self.operand(&s.value, locals, params),
            },
            I::GetElementPtr(g) => {
                let ptr = self.operand(&g.address, locals, params);
                let base_ty = {
                    let t = self.module.types.type_of(&g.address);
                    self.map_type_or_void(&t)
                };
                let source_ty = self
                    .mb
                    .types()
                    .pointee(base_ty)
                    .unwrap_or_else(|| self.mb.types().void());
                let indices = g
                    .indices
                    .iter()
                    .map(|i| match i {
                        llvm_ir::Operand::ConstantOperand(c) => match c.as_ref() {
                            llvm_ir::Constant::Int { value, .. } => {
                                GepIndex::Const(*value as i64)
                            }
                            _ => GepIndex::Dynamic(self.operand(i, locals, params)),
                        },
                        _ => GepIndex::Dynamic(self.operand(i, locals, params)),
                    })
                    .collect();
                InstKind::Gep { ptr, source_ty, indices }
            }
            I::BitCast(c) => InstKind::Cast {
                op: CastOp::BitCast,
                value: self.operand(&c.operand, locals, params),
            },
            I::AddrSpaceCast(c) => InstKind::Cast {
                op: CastOp::BitCast,
                value: self.operand(&c.operand, locals, params),
            },
            I::PtrToInt(c) => InstKind::Cast {
                op: CastOp::Other,
                value: self.operand(&c.operand, locals, params),
            },
            I::IntToPtr(c) => InstKind::Cast {
                op: CastOp::Other,
                value: self.operand(&c.operand, locals, params),
            },
            I::Trunc(c) => InstKind::Cast {
                op: CastOp::Other,
                value: self.operand(&c.operand, locals, params),
            },
            I::ZExt(c) => InstKind::Cast {
                op: CastOp::Other,
                value: self.operand(&c.operand, locals, params),
            },
            I::SExt(c) => InstKind::Cast {
                op: CastOp::Other,
                value: self.operand(&c.operand, locals, params),
            },
            I::Call(call) => self.translate_call(
                call.function.as_ref(),
                &call.arguments,
                locals,
                params,
            ),
            _ => InstKind::Other { operands: Vec::new() },
        };
        Inst { kind, ty, debug }
    }

    fn translate_terminator(
        &mut self,
        term: &llvm_ir::Terminator,
        locals: &FxHashMap<String, InstId>,
        params: &FxHashMap<String, u32>,
    ) -> Inst {
        use llvm_ir::Terminator as T;
        let debug = self.debug_of(term);
        let void = self.mb.types().void();
        let kind = match term {
            T::Ret(r) => InstKind::Ret {
                value: r.return_operand.as_ref().map(|v| self.operand(v, locals, params)),
            },
            T::Invoke(inv) => self.translate_call(
                inv.function.as_ref(),
                &inv.arguments,
                locals,
                params,
            ),
            _ => InstKind::Other { operands: Vec::new() },
        };
        Inst { kind, ty: void, debug }
    }

    fn translate_call(
        &mut self,
        function: either::Either<&llvm_ir::function::InlineAssembly, &llvm_ir::Operand>,
        arguments: &[(llvm_ir::Operand, Vec<llvm_ir::function::ParameterAttribute>)],
        locals: &FxHashMap<String, InstId>,
        params: &FxHashMap<String, u32>,
    ) -> InstKind {
        let args: Vec<Operand> =
            arguments.iter().map(|(a, _)| self.operand(a, locals, params)).collect();
        match function {
            either::Either::Left(_asm) => {
                let void = self.mb.types().void();
                let fty = self.mb.types().function(void, &[], false);
                InstKind::Call { callee: Callee::Asm, args, fty }
            }
            either::Either::Right(op) => {
                let op_ty = {
                    let t = self.module.types.type_of(op);
                    self.map_type_or_void(&t)
                };
                let fty = self.mb.types().pointee(op_ty).unwrap_or(op_ty);
                let callee = match op {
                    llvm_ir::Operand::ConstantOperand(c) => match c.as_ref() {
                        llvm_ir::Constant::GlobalReference { name, ty }
                            if matches!(ty.as_ref(), llvm_ir::Type::FuncType { .. }) =>
                        {
                            let mapped = self.map_type_or_void(ty);
                            Callee::Direct(self.external_function(&name_str(name), mapped))
                        }
                        _ => Callee::Indirect(Operand::Const(self.map_constant(c))),
                    },
                    _ => Callee::Indirect(self.operand(op, locals, params)),
                };
                InstKind::Call { callee, args, fty }
            }
        }
    }
}

fn name_str(name: &llvm_ir::Name) -> String {
    match name {
        llvm_ir::Name::Name(n) => (**n).clone(),
        llvm_ir::Name::Number(n) => n.to_string(),
    }
}
