//! SSA builder helpers
//!
//! A [`FunctionBuilder`] owns the body under construction and the single
//! emission cursor. The finished body is installed into the module with
//! [`Module::set_body`](super::module::Module::set_body).

use super::instr::{
    BinOp, BlockId, Callee, CastOp, CheckedOp, FloatPredicate, FunctionBody, Instr, IntPredicate,
    Phi, Reg, Terminator, Value,
};
use super::module::GlobalId;
use super::types::IrType;

/// Builder that simplifies IR construction
pub struct FunctionBuilder {
    body: FunctionBody,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a body with the given parameter types and an `entry` block
    pub fn new(params: &[IrType]) -> Self {
        let mut body = FunctionBody::new(params);
        let entry = body.add_block("entry");
        FunctionBuilder { body, current: entry }
    }

    pub fn param(&self, index: usize) -> Value {
        self.body.param(index)
    }

    pub fn entry_block(&self) -> BlockId {
        self.body.layout[0]
    }

    /// Create a new basic block at the end of the layout
    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.body.add_block(name)
    }

    /// Switch to emitting into a different block
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Whether the current block already has a terminator
    pub fn is_terminated(&self) -> bool {
        !self.body.block(self.current).terminator.is_none()
    }

    pub fn value_type(&self, value: &Value) -> IrType {
        self.body.value_type(value)
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut FunctionBody {
        &mut self.body
    }

    pub fn finish(self) -> FunctionBody {
        self.body
    }

    /// Emit an instruction into the current block
    pub fn emit(&mut self, instr: Instr) {
        self.body.block_mut(self.current).instrs.push(instr);
    }

    /// Set the terminator for the current block
    pub fn terminate(&mut self, term: Terminator) {
        self.body.block_mut(self.current).terminator = term;
    }

    fn def(&mut self, ty: IrType) -> Reg {
        self.body.alloc_reg(ty)
    }

    // ===== Memory =====

    /// Stack slot; allocas are always placed in the entry block
    pub fn alloca(&mut self, ty: IrType) -> Value {
        let dest = self.def(IrType::Ptr);
        let entry = self.entry_block();
        self.body.block_mut(entry).instrs.push(Instr::Alloca { dest, ty, count: None });
        dest.into()
    }

    /// Dynamically sized stack allocation in the current block
    pub fn alloca_array(&mut self, ty: IrType, count: Value) -> Value {
        let dest = self.def(IrType::Ptr);
        self.emit(Instr::Alloca { dest, ty, count: Some(count) });
        dest.into()
    }

    pub fn load(&mut self, ty: IrType, ptr: Value) -> Value {
        self.load_with(ty, ptr, false, None)
    }

    pub fn load_with(&mut self, ty: IrType, ptr: Value, volatile: bool, align: Option<u32>) -> Value {
        let dest = self.def(ty);
        self.emit(Instr::Load { dest, ty, ptr, volatile, align });
        dest.into()
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        self.store_with(value, ptr, false, None);
    }

    pub fn store_with(&mut self, value: Value, ptr: Value, volatile: bool, align: Option<u32>) {
        self.emit(Instr::Store { value, ptr, volatile, align });
    }

    pub fn gep(&mut self, base_ty: IrType, ptr: Value, indices: Vec<Value>) -> Value {
        let dest = self.def(IrType::Ptr);
        self.emit(Instr::Gep { dest, base_ty, ptr, indices });
        dest.into()
    }

    /// GEP with constant `i32` indices, starting with the leading 0
    pub fn struct_gep(&mut self, base_ty: IrType, ptr: Value, path: &[u32]) -> Value {
        let mut indices = vec![Value::i32(0)];
        indices.extend(path.iter().map(|i| Value::i32(*i as i32)));
        self.gep(base_ty, ptr, indices)
    }

    pub fn memset(&mut self, ptr: Value, byte: Value, len: Value) {
        self.emit(Instr::MemSet { ptr, byte, len, volatile: false });
    }

    pub fn memcpy(&mut self, dest: Value, src: Value, len: Value, volatile: bool) {
        self.emit(Instr::MemCopy { dest, src, len, volatile });
    }

    pub fn cmpxchg(&mut self, ptr: Value, expected: Value, new: Value) -> Value {
        let ty = self.value_type(&new);
        let dest = self.def(ty);
        self.emit(Instr::CmpXchg { dest, ptr, expected, new });
        dest.into()
    }

    // ===== Arithmetic =====

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.value_type(&lhs);
        let dest = self.def(ty);
        self.emit(Instr::Binary { dest, op, lhs, rhs });
        dest.into()
    }

    /// Returns the result and the `i1` overflow flag
    pub fn checked(&mut self, op: CheckedOp, lhs: Value, rhs: Value) -> (Value, Value) {
        let ty = self.value_type(&lhs);
        let dest = self.def(ty);
        let overflow = self.def(IrType::I1);
        self.emit(Instr::CheckedBinary { dest, overflow, op, lhs, rhs });
        (dest.into(), overflow.into())
    }

    pub fn fneg(&mut self, value: Value) -> Value {
        let ty = self.value_type(&value);
        let dest = self.def(ty);
        self.emit(Instr::FNeg { dest, value });
        dest.into()
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        let dest = self.def(IrType::I1);
        self.emit(Instr::ICmp { dest, pred, lhs, rhs });
        dest.into()
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Value, rhs: Value) -> Value {
        let dest = self.def(IrType::I1);
        self.emit(Instr::FCmp { dest, pred, lhs, rhs });
        dest.into()
    }

    pub fn cast(&mut self, op: CastOp, value: Value, ty: IrType) -> Value {
        let dest = self.def(ty);
        self.emit(Instr::Cast { dest, op, value, ty });
        dest.into()
    }

    /// Integer resize; no-op when widths already match
    pub fn int_cast(&mut self, value: Value, ty: IrType, signed: bool) -> Value {
        let from = self.value_type(&value);
        match (from.int_bits(), ty.int_bits()) {
            (Some(a), Some(b)) if a == b => value,
            (Some(a), Some(b)) if a > b => self.cast(CastOp::Trunc, value, ty),
            (Some(_), Some(_)) if signed => self.cast(CastOp::SExt, value, ty),
            (Some(_), Some(_)) => self.cast(CastOp::ZExt, value, ty),
            _ if from == IrType::Ptr && ty.is_int() => self.cast(CastOp::PtrToInt, value, ty),
            _ if from.is_int() && ty == IrType::Ptr => self.cast(CastOp::IntToPtr, value, ty),
            _ if from == ty => value,
            _ => self.cast(CastOp::Bitcast, value, ty),
        }
    }

    // ===== Calls =====

    pub fn call(&mut self, callee: Callee, args: Vec<Value>, ret: IrType) -> Option<Value> {
        self.call_with(callee, args, ret, false)
    }

    pub fn call_with(&mut self, callee: Callee, args: Vec<Value>, ret: IrType, tail: bool) -> Option<Value> {
        let dest = (ret != IrType::Void).then(|| self.def(ret));
        self.emit(Instr::Call { dest, callee, args, tail });
        dest.map(Value::Reg)
    }

    /// Call with an unwind edge; continues in `normal`
    pub fn invoke(&mut self, callee: Callee, args: Vec<Value>, ret: IrType, normal: BlockId, unwind: BlockId) -> Option<Value> {
        let dest = (ret != IrType::Void).then(|| self.def(ret));
        self.terminate(Terminator::Invoke { dest, callee, args, normal, unwind });
        self.switch_to_block(normal);
        dest.map(Value::Reg)
    }

    /// Returns the exception object and selector registers
    pub fn landing_pad(&mut self, catches: Vec<GlobalId>, cleanup: bool) -> (Value, Value) {
        let exn = self.def(IrType::Ptr);
        let selector = self.def(IrType::I32);
        self.emit(Instr::LandingPad { exn, selector, catches, cleanup });
        (exn.into(), selector.into())
    }

    // ===== SSA =====

    /// Placeholder join at the head of `block`
    pub fn phi(&mut self, block: BlockId, ty: IrType) -> Reg {
        let dest = self.def(ty);
        self.body.block_mut(block).phis.push(Phi { dest, ty, incoming: Vec::new() });
        dest
    }

    pub fn add_incoming(&mut self, block: BlockId, phi: Reg, value: Value, from: BlockId) {
        if let Some(p) = self.body.block_mut(block).phis.iter_mut().find(|p| p.dest == phi) {
            p.incoming.push((value, from));
        }
    }

    // ===== Terminators =====

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    pub fn cond_br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::CondBr { cond, then_block, else_block });
    }

    pub fn switch(&mut self, value: Value, default: BlockId, cases: Vec<(i64, BlockId)>) {
        self.terminate(Terminator::Switch { value, default, cases });
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.terminate(Terminator::Ret(value));
    }

    pub fn resume(&mut self, exn: Value, selector: Value) {
        self.terminate(Terminator::Resume { exn, selector });
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocas_land_in_entry() {
        let mut b = FunctionBuilder::new(&[IrType::I32]);
        let next = b.create_block("next");
        b.br(next);
        b.switch_to_block(next);
        let slot = b.alloca(IrType::I32);
        b.store(b.param(0), slot);
        b.ret(None);

        let body = b.finish();
        assert!(matches!(body.block(body.layout[0]).instrs[0], Instr::Alloca { .. }));
        assert!(matches!(body.block(next).instrs[0], Instr::Store { .. }));
    }

    #[test]
    fn test_int_cast_directions() {
        let mut b = FunctionBuilder::new(&[IrType::I32]);
        let p = b.param(0);
        assert_eq!(b.int_cast(p, IrType::I32, true), p);
        let wide = b.int_cast(p, IrType::I64, true);
        assert_eq!(b.value_type(&wide), IrType::I64);
        let narrow = b.int_cast(p, IrType::I8, false);
        assert_eq!(b.value_type(&narrow), IrType::I8);
        let instrs = &b.body().block(b.entry_block()).instrs;
        assert!(matches!(instrs[0], Instr::Cast { op: CastOp::SExt, .. }));
        assert!(matches!(instrs[1], Instr::Cast { op: CastOp::Trunc, .. }));
    }
}
