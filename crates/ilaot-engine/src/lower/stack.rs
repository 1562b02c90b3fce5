//! Evaluation stack values and representation changes
//!
//! Stack values use a widened representation: small integers are `i32`,
//! floats are `f64`, value types are whole aggregates. Storage uses the
//! type's value shape, so every load and store goes through
//! [`MethodLowerer::to_stack`] / [`MethodLowerer::from_stack`].

use ilaot_metadata::PrimitiveType;

use super::MethodLowerer;
use crate::error::{CompileError, CompileResult};
use crate::ir::{CastOp, IrType, Value};
use crate::layout::{Completeness, StackCategory, TypeId};

/// One entry of the simulated operand stack
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StackValue {
    pub category: StackCategory,
    /// Static type known for the value
    pub ty: TypeId,
    pub value: Value,
}

impl<'c, 'a> MethodLowerer<'c, 'a> {
    /// Push a value already in stack representation
    pub(super) fn push(&mut self, ty: TypeId, value: Value) {
        let category = self.cx.type_info(ty).category;
        self.stack.push(StackValue { category, ty, value });
    }

    pub(super) fn push_prim(&mut self, p: PrimitiveType, value: Value) -> CompileResult<()> {
        let ty = self.prim(p)?;
        self.push(ty, value);
        Ok(())
    }

    pub(super) fn push_int32(&mut self, value: Value) -> CompileResult<()> {
        self.push_prim(PrimitiveType::I4, value)
    }

    /// Push a value loaded in storage representation
    pub(super) fn push_stored(&mut self, ty: TypeId, value: Value) {
        let v = self.to_stack(ty, value);
        self.push(ty, v);
    }

    pub(super) fn pop(&mut self) -> CompileResult<StackValue> {
        self.stack.pop().ok_or_else(|| CompileError::malformed("evaluation stack underflow"))
    }

    /// Pop `n` values, returned in push order
    pub(super) fn pop_n(&mut self, n: usize) -> CompileResult<Vec<StackValue>> {
        if self.stack.len() < n {
            return Err(CompileError::malformed("evaluation stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub(super) fn peek(&self) -> CompileResult<StackValue> {
        self.stack.last().copied().ok_or_else(|| CompileError::malformed("evaluation stack underflow"))
    }

    pub(super) fn prim(&mut self, p: PrimitiveType) -> CompileResult<TypeId> {
        self.cx.type_of(&ilaot_metadata::TypeRef::Primitive(p), Completeness::StackComplete)
    }

    /// Widen a storage-shaped value to its stack representation
    pub(super) fn to_stack(&mut self, ty: TypeId, value: Value) -> Value {
        let info = self.cx.type_info(ty);
        match info.category {
            StackCategory::Int32 => {
                let signed = self.cx.is_signed(ty);
                self.b.int_cast(value, IrType::I32, signed)
            }
            StackCategory::Float if self.b.value_type(&value) == IrType::F32 => {
                self.b.cast(CastOp::FpExt, value, IrType::F64)
            }
            _ => value,
        }
    }

    /// Narrow a stack value to the storage shape of `ty`
    pub(super) fn from_stack(&mut self, sv: StackValue, ty: TypeId) -> CompileResult<Value> {
        let target = self.cx.type_info(ty).value;
        let signed = self.cx.is_signed(sv.ty);
        self.coerce(sv.value, target, signed)
    }

    /// Representation change between compatible scalar shapes
    pub(super) fn coerce(&mut self, value: Value, to: IrType, signed: bool) -> CompileResult<Value> {
        let from = self.b.value_type(&value);
        if from == to {
            return Ok(value);
        }
        let converted = match (from, to) {
            (f, t) if (f.is_int() || f == IrType::Ptr) && (t.is_int() || t == IrType::Ptr) => {
                self.b.int_cast(value, to, signed)
            }
            (IrType::F64, IrType::F32) => self.b.cast(CastOp::FpTrunc, value, to),
            (IrType::F32, IrType::F64) => self.b.cast(CastOp::FpExt, value, to),
            _ => {
                return Err(CompileError::malformed(format!(
                    "cannot store a {} value as {}",
                    self.cx.module.type_name(from),
                    self.cx.module.type_name(to)
                )))
            }
        };
        Ok(converted)
    }

    /// Integer view of a stack value, at pointer width when it was a pointer
    pub(super) fn int_value(&mut self, sv: StackValue) -> Value {
        if self.b.value_type(&sv.value) == IrType::Ptr {
            let iptr = self.iptr();
            self.b.int_cast(sv.value, iptr, false)
        } else {
            sv.value
        }
    }

    /// Pointer view of a stack value holding an address
    pub(super) fn ptr_value(&mut self, sv: StackValue) -> Value {
        if self.b.value_type(&sv.value).is_int() {
            self.b.int_cast(sv.value, IrType::Ptr, false)
        } else {
            sv.value
        }
    }

    /// Index operand widened to pointer width
    pub(super) fn index_value(&mut self, sv: StackValue) -> Value {
        let v = self.int_value(sv);
        let iptr = self.iptr();
        self.b.int_cast(v, iptr, true)
    }
}
