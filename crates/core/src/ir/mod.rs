//! In-memory IR consumed by the analysis.
//!
//! A [`Program`] owns the type arena plus program-wide function and global
//! tables; each [`Module`] records which entries belong to it. The loaders in
//! [`crate::backends`] populate this model, and everything in
//! [`crate::analysis`] is read-only over it.

pub mod builder;
pub mod types;

use serde::{Deserialize, Serialize};

pub use types::{TypeArena, TypeId, TypeKind};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// Index of a module within its [`Program`].
    ModuleId
);
id_type!(
    /// Program-wide function index.
    FuncId
);
id_type!(
    /// Program-wide global-variable index.
    GlobalId
);
id_type!(
    /// Index of an instruction within its function.
    InstId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    /// Symbol visible across modules.
    External,
    /// File-local (static) symbol.
    Internal,
}

/// Debug origin of a function definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprogram {
    /// Source-level name (demangled for C++).
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// A source location attached to an instruction, with the inlining chain
/// preserved: `inlined_at` points at the location this code was inlined into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub inlined_at: Option<Box<DebugLoc>>,
}

impl DebugLoc {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self { file: file.into(), line, inlined_at: None }
    }

    pub fn inlined_into(mut self, at: DebugLoc) -> Self {
        self.inlined_at = Some(Box::new(at));
        self
    }
}

/// A `!type` annotation on a global: the vtable's type identifier and the
/// byte offset of the address point it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMetadata {
    pub type_id: String,
    pub offset: u64,
}

/// IR constants, including the constant expressions the fact builder and the
/// layer walker must see through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constant {
    Int { ty: TypeId, value: i64 },
    Null { ty: TypeId },
    /// `zeroinitializer` of any type.
    Zero { ty: TypeId },
    /// The address of a function.
    Function(FuncId),
    /// The address of a global variable.
    Global(GlobalId),
    /// A struct/array/vector literal.
    Aggregate { ty: TypeId, elements: Vec<Constant> },
    /// A constant bitcast expression.
    BitCast { ty: TypeId, value: Box<Constant> },
    /// A constant `getelementptr` expression with all-constant indices.
    Gep { ty: TypeId, source_ty: TypeId, base: Box<Constant>, indices: Vec<i64> },
    /// A metadata string operand (type identifiers on intrinsic calls).
    Metadata(String),
}

impl Constant {
    /// The value's type, when it has one (metadata operands do not).
    pub fn ty(&self, prog: &Program) -> Option<TypeId> {
        match self {
            Constant::Int { ty, .. }
            | Constant::Null { ty }
            | Constant::Zero { ty }
            | Constant::Aggregate { ty, .. }
            | Constant::BitCast { ty, .. }
            | Constant::Gep { ty, .. } => Some(*ty),
            Constant::Function(f) => Some(prog.func(*f).ptr_ty),
            Constant::Global(g) => Some(prog.global(*g).ptr_ty),
            Constant::Metadata(_) => None,
        }
    }

    /// Peel constant pointer-cast expressions.
    pub fn strip_casts(&self) -> &Constant {
        let mut c = self;
        while let Constant::BitCast { value, .. } = c {
            c = value.as_ref();
        }
        c
    }

    pub fn as_function(&self) -> Option<FuncId> {
        match self.strip_casts() {
            Constant::Function(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.strip_casts(), Constant::Null { .. })
    }
}

/// An operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Result of another instruction in the same function.
    Inst(InstId),
    /// The n-th formal parameter.
    Arg(u32),
    Const(Constant),
}

/// One GEP index; the analysis only follows all-constant chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GepIndex {
    Const(i64),
    Dynamic(Operand),
}

impl GepIndex {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            GepIndex::Const(v) => Some(*v),
            GepIndex::Dynamic(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastOp {
    BitCast,
    /// Any other conversion (ptrtoint, trunc, ...). The walker still recurses
    /// through these as unary instructions.
    Other,
}

/// The callee position of a call instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Direct(FuncId),
    Indirect(Operand),
    /// Inline assembly; never a resolvable call.
    Asm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstKind {
    Alloca {
        allocated: TypeId,
    },
    Load {
        ptr: Operand,
    },
    Store {
        ptr: Operand,
        value: Operand,
    },
    Gep {
        ptr: Operand,
        source_ty: TypeId,
        indices: Vec<GepIndex>,
    },
    Cast {
        op: CastOp,
        value: Operand,
    },
    Call {
        callee: Callee,
        args: Vec<Operand>,
        /// The call-site function type.
        fty: TypeId,
    },
    Ret {
        value: Option<Operand>,
    },
    /// Anything else the analysis does not interpret; operands are kept so
    /// unary chains stay walkable.
    Other {
        operands: Vec<Operand>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    /// Result type (`void` for stores and the like).
    pub ty: TypeId,
    pub debug: Option<DebugLoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub module: ModuleId,
    pub linkage: Linkage,
    /// The function type.
    pub fty: TypeId,
    /// Pointer-to-`fty`, the type of this function used as a value.
    pub ptr_ty: TypeId,
    pub is_declaration: bool,
    pub insts: Vec<Inst>,
    pub subprogram: Option<Subprogram>,
}

impl Function {
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    /// LLVM intrinsics are never indirect-call targets or call-graph rows.
    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with("llvm.")
    }

    pub fn params<'a>(&self, types: &'a TypeArena) -> &'a [TypeId] {
        match types.kind(self.fty) {
            TypeKind::Function { params, .. } => params,
            _ => &[],
        }
    }

    pub fn is_vararg(&self, types: &TypeArena) -> bool {
        matches!(types.kind(self.fty), TypeKind::Function { vararg: true, .. })
    }

    pub fn ret_type(&self, types: &TypeArena) -> Option<TypeId> {
        match types.kind(self.fty) {
            TypeKind::Function { ret, .. } => Some(*ret),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub name: String,
    pub module: ModuleId,
    pub value_ty: TypeId,
    /// Pointer-to-`value_ty`, the type of this global used as a value.
    pub ptr_ty: TypeId,
    pub is_constant: bool,
    pub init: Option<Constant>,
    /// DWARF type name when the debug info marks this global as a C++ class
    /// instance (namespace-qualified, without the `class.` prefix).
    pub debug_class: Option<String>,
    /// `!type` vtable annotations.
    pub type_metadata: Vec<TypeMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Load path; doubles as the module identifier in diagnostics.
    pub name: String,
    pub source_file: String,
    pub functions: Vec<FuncId>,
    pub globals: Vec<GlobalId>,
    pub has_debug_info: bool,
}

/// The whole analyzed program: every loaded module plus the shared tables
/// they reference.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Program {
    pub types: TypeArena,
    pub modules: Vec<Module>,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.index()]
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.index()]
    }

    pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> {
        (0..self.modules.len() as u32).map(ModuleId)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
            && self.functions.is_empty()
            && self.globals.is_empty()
            && self.types.is_empty()
    }

    /// The type of an operand evaluated inside `func`.
    pub fn operand_type(&self, func: &Function, op: &Operand) -> Option<TypeId> {
        match op {
            Operand::Inst(i) => Some(func.inst(*i).ty),
            Operand::Arg(n) => func.params(&self.types).get(*n as usize).copied(),
            Operand::Const(c) => c.ty(self),
        }
    }

    /// Merge another program into this one, remapping every identifier.
    /// Returns the ids the absorbed modules received.
    pub fn absorb(&mut self, other: Program) -> Vec<ModuleId> {
        if self.is_empty() {
            let ids = other.module_ids().collect();
            *self = other;
            return ids;
        }

        let tmap = self.absorb_types(&other.types);
        let maps = IdMaps {
            types: &tmap,
            fbase: self.functions.len() as u32,
            gbase: self.globals.len() as u32,
            mbase: self.modules.len() as u32,
        };

        for mut f in other.functions {
            maps.remap_function(&mut f);
            self.functions.push(f);
        }
        for mut g in other.globals {
            maps.remap_global(&mut g);
            self.globals.push(g);
        }
        let mut new_ids = Vec::with_capacity(other.modules.len());
        for mut m in other.modules {
            m.functions = m.functions.into_iter().map(|f| maps.remap_func(f)).collect();
            m.globals = m.globals.into_iter().map(|g| maps.remap_gvar(g)).collect();
            new_ids.push(ModuleId(self.modules.len() as u32));
            self.modules.push(m);
        }
        new_ids
    }

    /// Intern every type of `other` into this arena, returning the id map.
    /// Named structs are declared first so recursive bodies terminate.
    fn absorb_types(&mut self, other: &TypeArena) -> Vec<TypeId> {
        let mut memo: Vec<Option<TypeId>> = vec![None; other.len()];
        for (name, id) in other.named_structs() {
            memo[id.index()] = Some(self.types.declare_struct(name));
        }
        let map: Vec<TypeId> =
            (0..other.len()).map(|i| self.absorb_type(other, TypeId(i as u32), &mut memo)).collect();
        for (_, id) in other.named_structs() {
            if let TypeKind::Struct { fields, .. } = other.kind(id) {
                let body = fields.iter().map(|f| map[f.index()]).collect();
                self.types.define_struct(map[id.index()], body);
            }
        }
        map
    }

    fn absorb_type(
        &mut self,
        other: &TypeArena,
        id: TypeId,
        memo: &mut Vec<Option<TypeId>>,
    ) -> TypeId {
        if let Some(t) = memo[id.index()] {
            return t;
        }
        let mapped = match other.kind(id).clone() {
            TypeKind::Pointer { pointee } => {
                let p = self.absorb_type(other, pointee, memo);
                self.types.pointer(p)
            }
            TypeKind::Array { element, len } => {
                let e = self.absorb_type(other, element, memo);
                self.types.array(e, len)
            }
            TypeKind::Vector { element, len } => {
                let e = self.absorb_type(other, element, memo);
                self.types.vector(e, len)
            }
            TypeKind::Struct { name: None, fields } => {
                let fields: Vec<TypeId> =
                    fields.iter().map(|&f| self.absorb_type(other, f, memo)).collect();
                self.types.anon_struct(&fields)
            }
            TypeKind::Function { ret, params, vararg } => {
                let r = self.absorb_type(other, ret, memo);
                let params: Vec<TypeId> =
                    params.iter().map(|&p| self.absorb_type(other, p, memo)).collect();
                self.types.function(r, &params, vararg)
            }
            // Named structs were pre-declared; anything left is a leaf.
            kind => self.types.intern(kind),
        };
        memo[id.index()] = Some(mapped);
        mapped
    }
}

/// Identifier translation used while absorbing one program into another.
struct IdMaps<'a> {
    types: &'a [TypeId],
    fbase: u32,
    gbase: u32,
    mbase: u32,
}

impl IdMaps<'_> {
    fn remap_type(&self, t: TypeId) -> TypeId {
        self.types[t.index()]
    }

    fn remap_func(&self, f: FuncId) -> FuncId {
        FuncId(f.0 + self.fbase)
    }

    fn remap_gvar(&self, g: GlobalId) -> GlobalId {
        GlobalId(g.0 + self.gbase)
    }

    fn remap_function(&self, f: &mut Function) {
        f.module = ModuleId(f.module.0 + self.mbase);
        f.fty = self.remap_type(f.fty);
        f.ptr_ty = self.remap_type(f.ptr_ty);
        for inst in &mut f.insts {
            self.remap_inst(inst);
        }
    }

    fn remap_global(&self, g: &mut GlobalVariable) {
        g.module = ModuleId(g.module.0 + self.mbase);
        g.value_ty = self.remap_type(g.value_ty);
        g.ptr_ty = self.remap_type(g.ptr_ty);
        if let Some(init) = &mut g.init {
            self.remap_constant(init);
        }
    }

    fn remap_inst(&self, inst: &mut Inst) {
        inst.ty = self.remap_type(inst.ty);
        match &mut inst.kind {
            InstKind::Alloca { allocated } => *allocated = self.remap_type(*allocated),
            InstKind::Load { ptr } => self.remap_operand(ptr),
            InstKind::Store { ptr, value } => {
                self.remap_operand(ptr);
                self.remap_operand(value);
            }
            InstKind::Gep { ptr, source_ty, indices } => {
                self.remap_operand(ptr);
                *source_ty = self.remap_type(*source_ty);
                for idx in indices {
                    if let GepIndex::Dynamic(op) = idx {
                        self.remap_operand(op);
                    }
                }
            }
            InstKind::Cast { value, .. } => self.remap_operand(value),
            InstKind::Call { callee, args, fty } => {
                match callee {
                    Callee::Direct(f) => *f = self.remap_func(*f),
                    Callee::Indirect(op) => self.remap_operand(op),
                    Callee::Asm => {}
                }
                for arg in args {
                    self.remap_operand(arg);
                }
                *fty = self.remap_type(*fty);
            }
            InstKind::Ret { value } => {
                if let Some(op) = value {
                    self.remap_operand(op);
                }
            }
            InstKind::Other { operands } => {
                for op in operands {
                    self.remap_operand(op);
                }
            }
        }
    }

    fn remap_operand(&self, op: &mut Operand) {
        if let Operand::Const(c) = op {
            self.remap_constant(c);
        }
    }

    fn remap_constant(&self, c: &mut Constant) {
        match c {
            Constant::Int { ty, .. } | Constant::Null { ty } | Constant::Zero { ty } => {
                *ty = self.remap_type(*ty)
            }
            Constant::Function(f) => *f = self.remap_func(*f),
            Constant::Global(g) => *g = self.remap_gvar(*g),
            Constant::Aggregate { ty, elements } => {
                *ty = self.remap_type(*ty);
                for e in elements {
                    self.remap_constant(e);
                }
            }
            Constant::BitCast { ty, value } => {
                *ty = self.remap_type(*ty);
                self.remap_constant(value);
            }
            Constant::Gep { ty, source_ty, base, .. } => {
                *ty = self.remap_type(*ty);
                *source_ty = self.remap_type(*source_ty);
                self.remap_constant(base);
            }
            Constant::Metadata(_) => {}
        }
    }
}

/// A cast-stripped view of an operand, the common first step of the fact
/// rules and the layer walker.
pub enum Stripped<'a> {
    Inst(InstId, &'a Inst),
    Arg(u32),
    Const(&'a Constant),
}

/// Peel bitcast instructions and constant cast expressions off an operand.
pub fn strip_operand<'a>(func: &'a Function, op: &'a Operand) -> Stripped<'a> {
    let mut op = op;
    loop {
        match op {
            Operand::Inst(i) => {
                let inst = func.inst(*i);
                if let InstKind::Cast { op: CastOp::BitCast, value } = &inst.kind {
                    op = value;
                    continue;
                }
                return Stripped::Inst(*i, inst);
            }
            Operand::Arg(n) => return Stripped::Arg(*n),
            Operand::Const(c) => return Stripped::Const(c.strip_casts()),
        }
    }
}

/// The function constant an operand resolves to after cast stripping, if any.
pub fn operand_as_function(func: &Function, op: &Operand) -> Option<FuncId> {
    match strip_operand(func, op) {
        Stripped::Const(c) => c.as_function(),
        _ => None,
    }
}
