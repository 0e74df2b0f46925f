//! Interned IR type system.
//!
//! Types are stored once in a program-wide [`TypeArena`] and referred to by
//! [`TypeId`] handles, so type equality is an integer compare. Named structs
//! intern by name (one entry per struct name, the way a linker sees them);
//! everything else interns structurally.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Handle to an interned type. Cheap to copy, O(1) equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Structural description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Void,
    Integer {
        bits: u32,
    },
    Float {
        bits: u32,
    },
    Pointer {
        pointee: TypeId,
    },
    Array {
        element: TypeId,
        len: u64,
    },
    Vector {
        element: TypeId,
        len: u64,
    },
    /// A struct. `name` is the IR-level name ("struct.foo", "class.Bar");
    /// anonymous literal structs have none.
    Struct {
        name: Option<String>,
        fields: Vec<TypeId>,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        vararg: bool,
    },
    /// Metadata operands (type identifiers attached to intrinsic calls).
    Metadata,
}

/// Program-wide type intern table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TypeArena {
    kinds: Vec<TypeKind>,
    named: FxHashMap<String, TypeId>,
    /// Structural dedup index; rebuilt after deserialization.
    #[serde(skip)]
    dedup: FxHashMap<TypeKind, TypeId>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.kinds[id.index()]
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Rebuild the structural dedup index, e.g. after deserializing an arena
    /// whose index was skipped.
    pub fn rebuild_index(&mut self) {
        self.dedup.clear();
        for (i, kind) in self.kinds.iter().enumerate() {
            if !matches!(kind, TypeKind::Struct { name: Some(_), .. }) {
                self.dedup.insert(kind.clone(), TypeId(i as u32));
            }
        }
    }

    /// Intern a type. Named structs are routed through the by-name table;
    /// all other kinds dedup structurally.
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let TypeKind::Struct { name: Some(name), fields } = kind {
            let id = self.declare_struct(&name);
            if !fields.is_empty() {
                self.define_struct(id, fields);
            }
            return id;
        }
        if let Some(&id) = self.dedup.get(&kind) {
            return id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.dedup.insert(kind.clone(), id);
        self.kinds.push(kind);
        id
    }

    /// Get or create the named struct `name`. A fresh entry starts with no
    /// fields (opaque) until [`define_struct`](Self::define_struct) runs.
    pub fn declare_struct(&mut self, name: &str) -> TypeId {
        if let Some(&id) = self.named.get(name) {
            return id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(TypeKind::Struct { name: Some(name.to_string()), fields: Vec::new() });
        self.named.insert(name.to_string(), id);
        id
    }

    /// Fill in the body of a declared struct. First definition wins.
    pub fn define_struct(&mut self, id: TypeId, new_fields: Vec<TypeId>) {
        if let TypeKind::Struct { fields, .. } = &mut self.kinds[id.index()] {
            if fields.is_empty() {
                *fields = new_fields;
            }
        }
    }

    pub fn named_struct(&self, name: &str) -> Option<TypeId> {
        self.named.get(name).copied()
    }

    /// Iterate all named struct types in the arena.
    pub fn named_structs(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.named.iter().map(|(n, &id)| (n.as_str(), id))
    }

    // Convenience constructors used throughout the builders and tests.

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    pub fn int(&mut self, bits: u32) -> TypeId {
        self.intern(TypeKind::Integer { bits })
    }

    pub fn float(&mut self, bits: u32) -> TypeId {
        self.intern(TypeKind::Float { bits })
    }

    pub fn pointer(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer { pointee })
    }

    pub fn array(&mut self, element: TypeId, len: u64) -> TypeId {
        self.intern(TypeKind::Array { element, len })
    }

    pub fn vector(&mut self, element: TypeId, len: u64) -> TypeId {
        self.intern(TypeKind::Vector { element, len })
    }

    pub fn function(&mut self, ret: TypeId, params: &[TypeId], vararg: bool) -> TypeId {
        self.intern(TypeKind::Function { ret, params: params.to_vec(), vararg })
    }

    pub fn struct_type(&mut self, name: &str, fields: &[TypeId]) -> TypeId {
        let id = self.declare_struct(name);
        self.define_struct(id, fields.to_vec());
        id
    }

    pub fn anon_struct(&mut self, fields: &[TypeId]) -> TypeId {
        self.intern(TypeKind::Struct { name: None, fields: fields.to_vec() })
    }

    /// `i8*`, the universal pointer in the conservative signature match.
    pub fn i8_ptr(&mut self) -> TypeId {
        let i8t = self.int(8);
        self.pointer(i8t)
    }

    /// Pointer-sized integer for the default data layout.
    pub fn int_ptr(&mut self) -> TypeId {
        self.int(64)
    }

    // Queries.

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Pointer { .. })
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Strip every level of pointer wrapping.
    pub fn ultimate_pointee(&self, mut id: TypeId) -> TypeId {
        while let Some(inner) = self.pointee(id) {
            id = inner;
        }
        id
    }

    /// Struct, array and vector types carry fields the analysis can confine.
    pub fn is_composite(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            TypeKind::Struct { .. } | TypeKind::Array { .. } | TypeKind::Vector { .. }
        )
    }

    pub fn struct_name(&self, id: TypeId) -> Option<&str> {
        match self.kind(id) {
            TypeKind::Struct { name, .. } => name.as_deref(),
            _ => None,
        }
    }

    pub fn is_struct(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Struct { .. })
    }

    /// Number of fields of a struct (elements of an array/vector).
    pub fn field_count(&self, id: TypeId) -> usize {
        match self.kind(id) {
            TypeKind::Struct { fields, .. } => fields.len(),
            TypeKind::Array { len, .. } | TypeKind::Vector { len, .. } => *len as usize,
            _ => 0,
        }
    }

    /// The type of field `idx` inside a composite.
    pub fn field_type(&self, id: TypeId, idx: i64) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Struct { fields, .. } => fields.get(usize::try_from(idx).ok()?).copied(),
            TypeKind::Array { element, .. } | TypeKind::Vector { element, .. } => Some(*element),
            _ => None,
        }
    }

    /// The type reached by indexing `source` with all GEP indices after the
    /// leading one (which only steps through the pointer).
    pub fn gep_indexed_type(&self, source: TypeId, trailing: &[i64]) -> Option<TypeId> {
        let mut ty = source;
        for &idx in trailing {
            ty = self.field_type(ty, idx)?;
        }
        Some(ty)
    }

    /// In-memory size under the default data layout. Struct layout ignores
    /// padding; the callers only ever ask about pointer-array vtables.
    pub fn alloc_size(&self, id: TypeId) -> u64 {
        match self.kind(id) {
            TypeKind::Void | TypeKind::Metadata | TypeKind::Function { .. } => 0,
            TypeKind::Integer { bits } | TypeKind::Float { bits } => u64::from((bits + 7) / 8),
            TypeKind::Pointer { .. } => 8,
            TypeKind::Array { element, len } | TypeKind::Vector { element, len } => {
                self.alloc_size(*element) * len
            }
            TypeKind::Struct { fields, .. } => {
                fields.iter().map(|&f| self.alloc_size(f)).sum()
            }
        }
    }

    /// Canonical printed form, following the LLVM textual syntax. This is
    /// what the fingerprinter hashes (after whitespace stripping).
    pub fn print(&self, id: TypeId) -> String {
        let mut out = String::new();
        self.print_into(id, &mut out);
        out
    }

    fn print_into(&self, id: TypeId, out: &mut String) {
        match self.kind(id) {
            TypeKind::Void => out.push_str("void"),
            TypeKind::Metadata => out.push_str("metadata"),
            TypeKind::Integer { bits } => {
                out.push('i');
                out.push_str(&bits.to_string());
            }
            TypeKind::Float { bits } => out.push_str(match bits {
                16 => "half",
                32 => "float",
                64 => "double",
                128 => "fp128",
                _ => "float",
            }),
            TypeKind::Pointer { pointee } => {
                self.print_into(*pointee, out);
                out.push('*');
            }
            TypeKind::Array { element, len } => {
                out.push('[');
                out.push_str(&len.to_string());
                out.push_str(" x ");
                self.print_into(*element, out);
                out.push(']');
            }
            TypeKind::Vector { element, len } => {
                out.push('<');
                out.push_str(&len.to_string());
                out.push_str(" x ");
                self.print_into(*element, out);
                out.push('>');
            }
            TypeKind::Struct { name: Some(name), .. } => {
                out.push('%');
                if name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_') {
                    out.push_str(name);
                } else {
                    out.push('"');
                    out.push_str(name);
                    out.push('"');
                }
            }
            TypeKind::Struct { name: None, fields } => {
                out.push_str("{ ");
                for (i, f) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.print_into(*f, out);
                }
                out.push_str(" }");
            }
            TypeKind::Function { ret, params, vararg } => {
                self.print_into(*ret, out);
                out.push_str(" (");
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.print_into(*p, out);
                }
                if *vararg {
                    if !params.is_empty() {
                        out.push_str(", ");
                    }
                    out.push_str("...");
                }
                out.push(')');
            }
        }
    }
}
