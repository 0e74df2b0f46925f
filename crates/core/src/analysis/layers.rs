//! Layer walker: the sequence of `(composite type, field index)` layers a
//! pointer value was addressed through.
//!
//! Layers are split by memory loads: starting from a called value or a store
//! destination, the walker climbs through loads and unary instructions to the
//! controlling GEP and then peels one enclosing composite per step, consuming
//! the GEP's constant indices from the innermost outwards.

use smallvec::SmallVec;

use crate::ir::{
    Constant, Function, GepIndex, InstKind, Operand, Program, Stripped, TypeId, strip_operand,
};

/// One enclosing layer. `idx` is `-1` when the layer has no field index
/// (an alloca'd object addressed as a whole).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub ty: TypeId,
    pub idx: i64,
}

enum Cursor<'a> {
    Op(&'a Operand),
    Const(&'a Constant),
}

/// Lazily yields the layers of one value. The sequence is finite: it is
/// bounded by the GEP's index count and the pointer chain in the IR.
pub struct LayerWalker<'a> {
    prog: &'a Program,
    func: &'a Function,
    cursor: Option<Cursor<'a>>,
    indices: SmallVec<[i64; 8]>,
    done: bool,
}

impl<'a> LayerWalker<'a> {
    pub fn new(prog: &'a Program, func: &'a Function, value: &'a Operand) -> Self {
        Self { prog, func, cursor: Some(Cursor::Op(value)), indices: SmallVec::new(), done: false }
    }

    /// Apply the bitcast correction: when the GEP's pointer operand was cast
    /// and the cast is what produced `ty`, a change in field count makes the
    /// layer unusable (bit-field merging shifted the indices), while an
    /// unchanged count means the pre-cast type is the one to trust.
    fn correct_for_bitcast(
        &self,
        ty: TypeId,
        stripped_ptr_ty: Option<TypeId>,
        ptr_ty: Option<TypeId>,
    ) -> Option<TypeId> {
        let types = &self.prog.types;
        let (Some(before), Some(after)) = (
            stripped_ptr_ty.and_then(|t| types.pointee(t)),
            ptr_ty.and_then(|t| types.pointee(t)),
        ) else {
            return Some(ty);
        };
        if before == after || after != ty {
            return Some(ty);
        }
        let n_before = if types.is_struct(before) { types.field_count(before) } else { 0 };
        let n_after = if types.is_struct(after) { types.field_count(after) } else { 0 };
        if n_before != n_after {
            return None;
        }
        Some(before)
    }

    fn gep_layer(
        &mut self,
        source_ty: TypeId,
        all_indices: &[i64],
        ptr_ty: Option<TypeId>,
        stripped_ptr_ty: Option<TypeId>,
    ) -> Option<Layer> {
        if all_indices.len() < 2 {
            return None;
        }
        if self.indices.is_empty() {
            self.indices.extend_from_slice(&all_indices[..all_indices.len() - 1]);
        }
        let types = &self.prog.types;
        let ty = types.gep_indexed_type(source_ty, self.indices.get(1..).unwrap_or(&[]))?;
        let ty = self.correct_for_bitcast(ty, stripped_ptr_ty, ptr_ty)?;
        if !types.is_composite(ty) {
            return None;
        }
        let idx = *all_indices.get(self.indices.len())?;
        self.indices.pop();
        if self.indices.is_empty() {
            self.done = true;
        }
        Some(Layer { ty, idx })
    }

    fn stripped_operand_type(&self, op: &Operand) -> Option<TypeId> {
        match strip_operand(self.func, op) {
            Stripped::Inst(_, inst) => Some(inst.ty),
            Stripped::Arg(n) => self.func.params(&self.prog.types).get(n as usize).copied(),
            Stripped::Const(c) => c.ty(self.prog),
        }
    }
}

impl Iterator for LayerWalker<'_> {
    type Item = Layer;

    fn next(&mut self) -> Option<Layer> {
        if self.done {
            return None;
        }
        let func = self.func;
        let prog = self.prog;
        let mut cur = self.cursor.take()?;
        loop {
            match cur {
                Cursor::Op(op) => match op {
                    Operand::Inst(i) => {
                        let inst = func.inst(*i);
                        match &inst.kind {
                            InstKind::Gep { ptr, source_ty, indices } => {
                                let consts: Option<Vec<i64>> =
                                    indices.iter().map(GepIndex::as_const).collect();
                                let Some(consts) = consts else {
                                    self.done = true;
                                    return None;
                                };
                                let ptr_ty = prog.operand_type(func, ptr);
                                let stripped_ty = self.stripped_operand_type(ptr);
                                let layer =
                                    self.gep_layer(*source_ty, &consts, ptr_ty, stripped_ty);
                                match layer {
                                    Some(_) if !self.done => self.cursor = Some(Cursor::Op(op)),
                                    Some(_) => {}
                                    None => self.done = true,
                                }
                                return layer;
                            }
                            InstKind::Load { ptr } => cur = Cursor::Op(ptr),
                            InstKind::Alloca { allocated } => {
                                self.done = true;
                                return Some(Layer { ty: *allocated, idx: -1 });
                            }
                            InstKind::Cast { value, .. } => cur = Cursor::Op(value),
                            InstKind::Other { operands } if operands.len() == 1 => {
                                cur = Cursor::Op(&operands[0])
                            }
                            _ => {
                                self.done = true;
                                return None;
                            }
                        }
                    }
                    Operand::Const(c) => cur = Cursor::Const(c),
                    Operand::Arg(_) => {
                        self.done = true;
                        return None;
                    }
                },
                Cursor::Const(c) => match c {
                    Constant::Gep { source_ty, base, indices, .. } => {
                        let base_ty = base.ty(prog);
                        let stripped_ty = base.strip_casts().ty(prog);
                        let layer = self.gep_layer(*source_ty, indices, base_ty, stripped_ty);
                        match layer {
                            Some(_) if !self.done => self.cursor = Some(Cursor::Const(c)),
                            Some(_) => {}
                            None => self.done = true,
                        }
                        return layer;
                    }
                    _ => {
                        self.done = true;
                        return None;
                    }
                },
            }
        }
    }
}
