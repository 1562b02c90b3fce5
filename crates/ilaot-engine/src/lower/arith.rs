//! Arithmetic, comparisons, conversions and conditional branches

use ilaot_metadata::{BinaryOp, BranchCondition, CompareOp, ConvTarget, Offset, OverflowCheck, PrimitiveType, UnaryOp};

use super::{Flow, MethodLowerer, StackValue};
use crate::error::{CompileError, CompileResult};
use crate::ir::{BinOp, CastOp, CheckedOp, FloatPredicate, IntPredicate, IrType, Value};
use crate::layout::{StackCategory, TypeId};
use crate::runtime::RuntimeFn;

/// Operand kind after binary promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operands {
    Int(IrType),
    Float,
}

impl<'c, 'a> MethodLowerer<'c, 'a> {
    /// Promote two operands to a common representation
    fn promote(&mut self, lhs: StackValue, rhs: StackValue) -> CompileResult<(Operands, Value, Value, TypeId)> {
        use StackCategory as C;
        match (lhs.category, rhs.category) {
            (C::Float, C::Float) => Ok((Operands::Float, lhs.value, rhs.value, lhs.ty)),
            (C::Int32, C::Int32) => Ok((Operands::Int(IrType::I32), lhs.value, rhs.value, lhs.ty)),
            (C::Int64, C::Int64) => Ok((Operands::Int(IrType::I64), lhs.value, rhs.value, lhs.ty)),
            (C::NativeInt | C::Int32 | C::Reference | C::Object, C::NativeInt | C::Int32 | C::Reference | C::Object) => {
                let iptr = self.iptr();
                let l = self.index_value(lhs);
                let r = self.index_value(rhs);
                let ty = match (lhs.category, rhs.category) {
                    (C::Reference, C::Reference) => self.prim(PrimitiveType::I)?,
                    (C::Reference, _) => lhs.ty,
                    (_, C::Reference) => rhs.ty,
                    _ => self.prim(PrimitiveType::I)?,
                };
                Ok((Operands::Int(iptr), l, r, ty))
            }
            (a, b) => Err(CompileError::malformed(format!("operands {:?} and {:?} cannot be combined", a, b))),
        }
    }

    pub(super) fn lower_binary(&mut self, op: BinaryOp, overflow: OverflowCheck) -> CompileResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        if matches!(op, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn) {
            let amount = self.int_value(rhs);
            let value = self.int_value(lhs);
            let ty = self.b.value_type(&value);
            let amount = self.b.int_cast(amount, ty, false);
            let bin = match op {
                BinaryOp::Shl => BinOp::Shl,
                BinaryOp::Shr => BinOp::AShr,
                _ => BinOp::LShr,
            };
            let result = self.b.binary(bin, value, amount);
            let result_ty = if lhs.category == StackCategory::Int32 || lhs.category == StackCategory::Int64 {
                lhs.ty
            } else {
                self.prim(PrimitiveType::I)?
            };
            self.push(result_ty, result);
            return Ok(());
        }

        let (kind, l, r, ty) = self.promote(lhs, rhs)?;
        let result = match (kind, overflow) {
            (Operands::Float, _) => {
                let bin = match op {
                    BinaryOp::Add => BinOp::FAdd,
                    BinaryOp::Sub => BinOp::FSub,
                    BinaryOp::Mul => BinOp::FMul,
                    BinaryOp::Div | BinaryOp::DivUn => BinOp::FDiv,
                    BinaryOp::Rem | BinaryOp::RemUn => BinOp::FRem,
                    other => return Err(CompileError::malformed(format!("{:?} on floating operands", other))),
                };
                self.b.binary(bin, l, r)
            }
            (Operands::Int(_), OverflowCheck::None) => {
                let bin = match op {
                    BinaryOp::Add => BinOp::Add,
                    BinaryOp::Sub => BinOp::Sub,
                    BinaryOp::Mul => BinOp::Mul,
                    BinaryOp::Div => BinOp::SDiv,
                    BinaryOp::DivUn => BinOp::UDiv,
                    BinaryOp::Rem => BinOp::SRem,
                    BinaryOp::RemUn => BinOp::URem,
                    BinaryOp::And => BinOp::And,
                    BinaryOp::Or => BinOp::Or,
                    BinaryOp::Xor => BinOp::Xor,
                    BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn => {
                        return Err(CompileError::malformed("shift lowered as arithmetic"))
                    }
                };
                self.b.binary(bin, l, r)
            }
            (Operands::Int(_), check) => {
                let signed = check == OverflowCheck::Signed;
                let checked = match (op, signed) {
                    (BinaryOp::Add, true) => CheckedOp::SAdd,
                    (BinaryOp::Add, false) => CheckedOp::UAdd,
                    (BinaryOp::Sub, true) => CheckedOp::SSub,
                    (BinaryOp::Sub, false) => CheckedOp::USub,
                    (BinaryOp::Mul, true) => CheckedOp::SMul,
                    (BinaryOp::Mul, false) => CheckedOp::UMul,
                    (other, _) => return Err(CompileError::malformed(format!("{:?} has no overflow-checked form", other))),
                };
                let (value, overflowed) = self.b.checked(checked, l, r);
                self.branch_on_overflow(overflowed)?;
                value
            }
        };
        let result = if self.cx.type_info(ty).category == StackCategory::Reference {
            self.b.int_cast(result, IrType::Ptr, false)
        } else {
            result
        };
        self.push(ty, result);
        Ok(())
    }

    /// Continue when `overflowed` is false, raise the overflow exception otherwise
    fn branch_on_overflow(&mut self, overflowed: Value) -> CompileResult<()> {
        let raise = self.b.create_block("ovf.throw");
        let cont = self.b.create_block("ovf.cont");
        self.b.cond_br(overflowed, raise, cont);
        self.b.switch_to_block(raise);
        let throw = self.cx.runtime_fn(RuntimeFn::ThrowOverflow);
        self.emit_call(crate::ir::Callee::Direct(throw), Vec::new(), IrType::Void);
        self.b.unreachable();
        self.b.switch_to_block(cont);
        Ok(())
    }

    pub(super) fn lower_unary(&mut self, op: UnaryOp) -> CompileResult<()> {
        let v = self.pop()?;
        let result = match (op, v.category) {
            (UnaryOp::Neg, StackCategory::Float) => self.b.fneg(v.value),
            (UnaryOp::Neg, StackCategory::Int32 | StackCategory::Int64 | StackCategory::NativeInt) => {
                let value = self.int_value(v);
                let ty = self.b.value_type(&value);
                self.b.binary(BinOp::Sub, Value::int(ty, 0), value)
            }
            (UnaryOp::Not, StackCategory::Int32 | StackCategory::Int64 | StackCategory::NativeInt) => {
                let value = self.int_value(v);
                let ty = self.b.value_type(&value);
                self.b.binary(BinOp::Xor, value, Value::int(ty, -1))
            }
            (op, category) => return Err(CompileError::malformed(format!("{:?} on a {:?} operand", op, category))),
        };
        let ty = if v.category == StackCategory::NativeInt { self.prim(PrimitiveType::I)? } else { v.ty };
        self.push(ty, result);
        Ok(())
    }

    /// `i1` result of comparing the two topmost values
    fn compare(&mut self, int: IntPredicate, float: FloatPredicate) -> CompileResult<Value> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let (kind, l, r, _) = self.promote(lhs, rhs)?;
        Ok(match kind {
            Operands::Float => self.b.fcmp(float, l, r),
            Operands::Int(_) => self.b.icmp(int, l, r),
        })
    }

    pub(super) fn lower_compare(&mut self, op: CompareOp) -> CompileResult<()> {
        let (int, float) = match op {
            CompareOp::Eq => (IntPredicate::Eq, FloatPredicate::Oeq),
            CompareOp::Gt => (IntPredicate::Sgt, FloatPredicate::Ogt),
            CompareOp::GtUn => (IntPredicate::Ugt, FloatPredicate::Ugt),
            CompareOp::Lt => (IntPredicate::Slt, FloatPredicate::Olt),
            CompareOp::LtUn => (IntPredicate::Ult, FloatPredicate::Ult),
        };
        let flag = self.compare(int, float)?;
        let widened = self.b.int_cast(flag, IrType::I32, false);
        self.push_int32(widened)
    }

    pub(super) fn lower_compare_branch(&mut self, cond: BranchCondition, target: Offset) -> CompileResult<()> {
        use BranchCondition as B;
        let (int, float) = match cond {
            B::Eq => (IntPredicate::Eq, FloatPredicate::Oeq),
            B::NeUn => (IntPredicate::Ne, FloatPredicate::Une),
            B::Ge => (IntPredicate::Sge, FloatPredicate::Oge),
            B::GeUn => (IntPredicate::Uge, FloatPredicate::Uge),
            B::Gt => (IntPredicate::Sgt, FloatPredicate::Ogt),
            B::GtUn => (IntPredicate::Ugt, FloatPredicate::Ugt),
            B::Le => (IntPredicate::Sle, FloatPredicate::Ole),
            B::LeUn => (IntPredicate::Ule, FloatPredicate::Ule),
            B::Lt => (IntPredicate::Slt, FloatPredicate::Olt),
            B::LtUn => (IntPredicate::Ult, FloatPredicate::Ult),
        };
        let flag = self.compare(int, float)?;
        self.conditional_branch(flag, target)
    }

    /// `brtrue` / `brfalse`: compare against zero or null
    pub(super) fn lower_truth_branch(&mut self, target: Offset, when: bool) -> CompileResult<()> {
        let v = self.pop()?;
        let ty = self.b.value_type(&v.value);
        let pred = if when { IntPredicate::Ne } else { IntPredicate::Eq };
        let flag = match ty {
            IrType::Ptr => self.b.icmp(pred, v.value, Value::Null),
            t if t.is_float() => {
                let fpred = if when { FloatPredicate::Une } else { FloatPredicate::Oeq };
                self.b.fcmp(fpred, v.value, Value::Float { ty: t, value: 0.0 })
            }
            t if t.is_int() => self.b.icmp(pred, v.value, Value::int(t, 0)),
            _ => return Err(CompileError::malformed(format!("{:?} value used as a condition", v.category))),
        };
        self.conditional_branch(flag, target)
    }

    fn conditional_branch(&mut self, flag: Value, target: Offset) -> CompileResult<()> {
        let taken = self.merge_into(target)?;
        let fallthrough = self.merge_into(self.next_offset)?;
        self.b.cond_br(flag, taken, fallthrough);
        self.flow = Flow::Explicit;
        Ok(())
    }

    pub(super) fn lower_conv(&mut self, target: ConvTarget, overflow: OverflowCheck) -> CompileResult<()> {
        use ConvTarget as T;
        let v = self.pop()?;
        let iptr = self.iptr();
        // storage width, signedness, stack width, result type
        let (width, target_signed, stack, result) = match target {
            T::I1 => (IrType::I8, true, IrType::I32, PrimitiveType::I4),
            T::U1 => (IrType::I8, false, IrType::I32, PrimitiveType::I4),
            T::I2 => (IrType::I16, true, IrType::I32, PrimitiveType::I4),
            T::U2 => (IrType::I16, false, IrType::I32, PrimitiveType::I4),
            T::I4 => (IrType::I32, true, IrType::I32, PrimitiveType::I4),
            T::U4 => (IrType::I32, false, IrType::I32, PrimitiveType::I4),
            T::I8 => (IrType::I64, true, IrType::I64, PrimitiveType::I8),
            T::U8 => (IrType::I64, false, IrType::I64, PrimitiveType::I8),
            T::I => (iptr, true, iptr, PrimitiveType::I),
            T::U => (iptr, false, iptr, PrimitiveType::I),
            T::R4 | T::R8 | T::RUn => return self.conv_to_float(v, target),
        };
        let result_ty = self.prim(result)?;

        let converted = if v.category == StackCategory::Float {
            let op = if target_signed { CastOp::FpToSi } else { CastOp::FpToUi };
            let narrow = self.b.cast(op, v.value, width);
            if overflow != OverflowCheck::None {
                let back = self.b.cast(if target_signed { CastOp::SiToFp } else { CastOp::UiToFp }, narrow, IrType::F64);
                let lost = self.b.fcmp(FloatPredicate::Une, back, v.value);
                self.branch_on_overflow(lost)?;
            }
            self.b.int_cast(narrow, stack, target_signed)
        } else {
            let value = self.int_value(v);
            let source_bits = self.b.value_type(&value).int_bits().unwrap_or(32);
            let target_bits = width.int_bits().unwrap_or(32);
            // checked widening reads the source with its own signedness
            let read_signed = match overflow {
                OverflowCheck::Unsigned if target_bits > source_bits => false,
                OverflowCheck::Signed if target_bits > source_bits => true,
                _ => target_signed,
            };
            let narrow = self.b.int_cast(value, width, read_signed);
            match overflow {
                OverflowCheck::None => self.b.int_cast(narrow, stack, target_signed),
                check => {
                    let source_signed = check == OverflowCheck::Signed;
                    let source_ty = self.b.value_type(&value);
                    let mut lost = None;
                    if target_bits < source_bits {
                        let back = self.b.int_cast(narrow, source_ty, target_signed);
                        lost = Some(self.b.icmp(IntPredicate::Ne, back, value));
                    }
                    let sign = match (source_signed, target_signed) {
                        (true, false) => Some(self.b.icmp(IntPredicate::Slt, value, Value::int(source_ty, 0))),
                        (false, true) if target_bits <= source_bits => {
                            Some(self.b.icmp(IntPredicate::Slt, narrow, Value::int(width, 0)))
                        }
                        _ => None,
                    };
                    let flag = match (lost, sign) {
                        (Some(a), Some(b)) => Some(self.b.binary(BinOp::Or, a, b)),
                        (a, b) => a.or(b),
                    };
                    if let Some(flag) = flag {
                        self.branch_on_overflow(flag)?;
                    }
                    let extend_signed = if target_bits > source_bits { source_signed } else { target_signed };
                    self.b.int_cast(narrow, stack, extend_signed)
                }
            }
        };
        self.push(result_ty, converted);
        Ok(())
    }

    fn conv_to_float(&mut self, v: StackValue, target: ConvTarget) -> CompileResult<()> {
        let ty = self.prim(PrimitiveType::R8)?;
        let value = match v.category {
            StackCategory::Float => match target {
                ConvTarget::R4 => {
                    let single = self.b.cast(CastOp::FpTrunc, v.value, IrType::F32);
                    self.b.cast(CastOp::FpExt, single, IrType::F64)
                }
                _ => v.value,
            },
            StackCategory::Int32 | StackCategory::Int64 | StackCategory::NativeInt => {
                let int = self.int_value(v);
                match target {
                    ConvTarget::RUn => self.b.cast(CastOp::UiToFp, int, IrType::F64),
                    ConvTarget::R4 => {
                        let single = self.b.cast(CastOp::SiToFp, int, IrType::F32);
                        self.b.cast(CastOp::FpExt, single, IrType::F64)
                    }
                    _ => self.b.cast(CastOp::SiToFp, int, IrType::F64),
                }
            }
            other => return Err(CompileError::malformed(format!("conversion of a {:?} value to float", other))),
        };
        self.push(ty, value);
        Ok(())
    }
}
