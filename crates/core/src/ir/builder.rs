//! Programmatic construction of IR modules.
//!
//! The loaders use this to translate external representations into the owned
//! model, and the test corpus uses it to encode whole scenarios without an
//! LLVM toolchain in the loop.

use super::types::TypeId;
use super::{
    Callee, CastOp, Constant, DebugLoc, FuncId, Function, GepIndex, GlobalId, GlobalVariable, Inst,
    InstId, InstKind, Linkage, Module, ModuleId, Operand, Program, Subprogram, TypeMetadata,
};

/// Builds one module inside a [`Program`].
pub struct ModuleBuilder<'p> {
    prog: &'p mut Program,
    module: ModuleId,
}

impl<'p> ModuleBuilder<'p> {
    pub fn new(prog: &'p mut Program, name: impl Into<String>, source_file: impl Into<String>) -> Self {
        let module = ModuleId::new(prog.modules.len() as u32);
        prog.modules.push(Module {
            name: name.into(),
            source_file: source_file.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            has_debug_info: true,
        });
        Self { prog, module }
    }

    pub fn module_id(&self) -> ModuleId {
        self.module
    }

    pub fn program(&mut self) -> &mut Program {
        &mut *self.prog
    }

    pub fn types(&mut self) -> &mut super::TypeArena {
        &mut self.prog.types
    }

    pub fn mark_no_debug_info(&mut self) {
        self.prog.modules[self.module.index()].has_debug_info = false;
    }

    fn push_function(&mut self, name: String, fty: TypeId, linkage: Linkage, decl: bool) -> FuncId {
        let ptr_ty = self.prog.types.pointer(fty);
        let id = FuncId::new(self.prog.functions.len() as u32);
        self.prog.functions.push(Function {
            name,
            module: self.module,
            linkage,
            fty,
            ptr_ty,
            is_declaration: decl,
            insts: Vec::new(),
            subprogram: None,
        });
        self.prog.modules[self.module.index()].functions.push(id);
        id
    }

    /// Add a function declaration (no body in this module).
    pub fn declare_function(&mut self, name: impl Into<String>, fty: TypeId, linkage: Linkage) -> FuncId {
        self.push_function(name.into(), fty, linkage, true)
    }

    /// Add a function definition; fill its body with [`Self::body`].
    pub fn define_function(&mut self, name: impl Into<String>, fty: TypeId, linkage: Linkage) -> FuncId {
        self.push_function(name.into(), fty, linkage, false)
    }

    pub fn set_subprogram(
        &mut self,
        func: FuncId,
        name: impl Into<String>,
        file: impl Into<String>,
        line: u32,
    ) {
        self.prog.functions[func.index()].subprogram =
            Some(Subprogram { name: name.into(), file: file.into(), line });
    }

    pub fn add_global(&mut self, name: impl Into<String>, value_ty: TypeId, init: Option<Constant>) -> GlobalId {
        let ptr_ty = self.prog.types.pointer(value_ty);
        let id = GlobalId::new(self.prog.globals.len() as u32);
        self.prog.globals.push(GlobalVariable {
            name: name.into(),
            module: self.module,
            value_ty,
            ptr_ty,
            is_constant: false,
            init,
            debug_class: None,
            type_metadata: Vec::new(),
        });
        self.prog.modules[self.module.index()].globals.push(id);
        id
    }

    pub fn set_global_constant(&mut self, global: GlobalId) {
        self.prog.globals[global.index()].is_constant = true;
    }

    /// Fill a global's initializer after the fact (loaders create every
    /// global first so initializers can reference any of them).
    pub fn set_global_init(&mut self, global: GlobalId, init: Constant) {
        self.prog.globals[global.index()].init = Some(init);
    }

    pub fn set_global_debug_class(&mut self, global: GlobalId, class_name: impl Into<String>) {
        self.prog.globals[global.index()].debug_class = Some(class_name.into());
    }

    pub fn add_global_type_metadata(&mut self, global: GlobalId, type_id: impl Into<String>, offset: u64) {
        self.prog.globals[global.index()]
            .type_metadata
            .push(TypeMetadata { type_id: type_id.into(), offset });
    }

    /// A constant GEP expression over `base` (the result is a pointer to the
    /// indexed type).
    pub fn const_gep(&mut self, source_ty: TypeId, base: Constant, indices: &[i64]) -> Constant {
        let trailing = indices.get(1..).unwrap_or(&[]);
        let indexed = self.prog.types.gep_indexed_type(source_ty, trailing).unwrap_or(source_ty);
        let ty = self.prog.types.pointer(indexed);
        Constant::Gep { ty, source_ty, base: Box::new(base), indices: indices.to_vec() }
    }

    pub fn const_bitcast(&mut self, value: Constant, to: TypeId) -> Constant {
        Constant::BitCast { ty: to, value: Box::new(value) }
    }

    /// Start appending instructions to `func`.
    pub fn body(&mut self, func: FuncId) -> FunctionBuilder<'_> {
        FunctionBuilder { prog: &mut *self.prog, func, loc: None }
    }
}

/// Appends instructions to one function.
pub struct FunctionBuilder<'p> {
    prog: &'p mut Program,
    func: FuncId,
    loc: Option<DebugLoc>,
}

impl FunctionBuilder<'_> {
    /// Attach this source location to subsequently built instructions.
    pub fn set_loc(&mut self, file: impl Into<String>, line: u32) {
        self.loc = Some(DebugLoc::new(file, line));
    }

    /// Attach a full location (with an inlining chain) to what follows.
    pub fn set_debug(&mut self, loc: DebugLoc) {
        self.loc = Some(loc);
    }

    pub fn clear_loc(&mut self) {
        self.loc = None;
    }

    fn push(&mut self, kind: InstKind, ty: TypeId) -> Operand {
        let f = &mut self.prog.functions[self.func.index()];
        let id = InstId::new(f.insts.len() as u32);
        f.insts.push(Inst { kind, ty, debug: self.loc.clone() });
        Operand::Inst(id)
    }

    pub fn alloca(&mut self, allocated: TypeId) -> Operand {
        let ty = self.prog.types.pointer(allocated);
        self.push(InstKind::Alloca { allocated }, ty)
    }

    pub fn load(&mut self, ptr: Operand) -> Operand {
        let pointee = {
            let func = &self.prog.functions[self.func.index()];
            self.prog.operand_type(func, &ptr).and_then(|t| self.prog.types.pointee(t))
        };
        let ty = match pointee {
            Some(t) => t,
            None => self.void(),
        };
        self.push(InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, value: Operand, ptr: Operand) {
        let void = self.void();
        self.push(InstKind::Store { ptr, value }, void);
    }

    pub fn gep(&mut self, source_ty: TypeId, ptr: Operand, indices: &[i64]) -> Operand {
        let trailing = indices.get(1..).unwrap_or(&[]);
        let indexed = self.prog.types.gep_indexed_type(source_ty, trailing).unwrap_or(source_ty);
        let ty = self.prog.types.pointer(indexed);
        let indices = indices.iter().map(|&i| GepIndex::Const(i)).collect();
        self.push(InstKind::Gep { ptr, source_ty, indices }, ty)
    }

    pub fn gep_dynamic(&mut self, source_ty: TypeId, ptr: Operand, indices: Vec<GepIndex>) -> Operand {
        let ty = self.prog.types.pointer(source_ty);
        self.push(InstKind::Gep { ptr, source_ty, indices }, ty)
    }

    pub fn bitcast(&mut self, value: Operand, to: TypeId) -> Operand {
        self.push(InstKind::Cast { op: CastOp::BitCast, value }, to)
    }

    pub fn cast(&mut self, op: CastOp, value: Operand, to: TypeId) -> Operand {
        self.push(InstKind::Cast { op, value }, to)
    }

    pub fn call_direct(&mut self, callee: FuncId, args: Vec<Operand>) -> Operand {
        let fty = self.prog.func(callee).fty;
        let ret = self.ret_of(fty);
        self.push(InstKind::Call { callee: Callee::Direct(callee), args, fty }, ret)
    }

    pub fn call_indirect(&mut self, fty: TypeId, callee: Operand, args: Vec<Operand>) -> Operand {
        let ret = self.ret_of(fty);
        self.push(InstKind::Call { callee: Callee::Indirect(callee), args, fty }, ret)
    }

    pub fn call_asm(&mut self, fty: TypeId) -> Operand {
        let ret = self.ret_of(fty);
        self.push(InstKind::Call { callee: Callee::Asm, args: Vec::new(), fty }, ret)
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        let void = self.void();
        self.push(InstKind::Ret { value }, void);
    }

    pub fn other(&mut self, operands: Vec<Operand>, ty: TypeId) -> Operand {
        self.push(InstKind::Other { operands }, ty)
    }

    // Operand shorthands.

    pub fn func_addr(&self, f: FuncId) -> Operand {
        Operand::Const(Constant::Function(f))
    }

    pub fn global_addr(&self, g: GlobalId) -> Operand {
        Operand::Const(Constant::Global(g))
    }

    pub fn const_int(&mut self, bits: u32, value: i64) -> Operand {
        let ty = self.prog.types.int(bits);
        Operand::Const(Constant::Int { ty, value })
    }

    pub fn null(&mut self, ty: TypeId) -> Operand {
        Operand::Const(Constant::Null { ty })
    }

    fn void(&mut self) -> TypeId {
        self.prog.types.void()
    }

    fn ret_of(&mut self, fty: TypeId) -> TypeId {
        match self.prog.types.kind(fty) {
            super::TypeKind::Function { ret, .. } => *ret,
            _ => self.void(),
        }
    }
}
