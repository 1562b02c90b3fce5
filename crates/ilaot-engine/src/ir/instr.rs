//! IR instructions, blocks, and function bodies
//!
//! SSA form over virtual registers. Each block holds its phis, an instruction
//! list and exactly one terminator; block order for emission is an explicit
//! layout list separate from block ids.

use std::fmt;

use super::module::{FuncId, GlobalId};
use super::types::IrType;

/// Virtual register (SSA value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%r{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// An instruction operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Reg(Reg),
    Int { ty: IrType, value: i64 },
    Float { ty: IrType, value: f64 },
    Null,
    Undef(IrType),
    /// Address of a global
    Global(GlobalId),
    /// Address of a function
    Function(FuncId),
}

impl Value {
    pub fn i1(value: bool) -> Value {
        Value::Int { ty: IrType::I1, value: value as i64 }
    }

    pub fn i8(value: i8) -> Value {
        Value::Int { ty: IrType::I8, value: value as i64 }
    }

    pub fn i32(value: i32) -> Value {
        Value::Int { ty: IrType::I32, value: value as i64 }
    }

    pub fn i64(value: i64) -> Value {
        Value::Int { ty: IrType::I64, value }
    }

    pub fn int(ty: IrType, value: i64) -> Value {
        Value::Int { ty, value }
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Value::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// Constant integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl From<Reg> for Value {
    fn from(reg: Reg) -> Self {
        Value::Reg(reg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    AShr,
    LShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

/// Arithmetic that also reports overflow as an `i1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckedOp {
    SAdd,
    UAdd,
    SSub,
    USub,
    SMul,
    UMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Sgt,
    Sge,
    Slt,
    Sle,
    Ugt,
    Uge,
    Ult,
    Ule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    Oeq,
    One,
    Ogt,
    Oge,
    Olt,
    Ole,
    Ueq,
    Une,
    Ugt,
    Uge,
    Ult,
    Ule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpToSi,
    FpToUi,
    SiToFp,
    UiToFp,
    FpTrunc,
    FpExt,
    PtrToInt,
    IntToPtr,
    Bitcast,
}

/// Signature of a function or indirect call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSig {
    pub params: Vec<IrType>,
    pub ret: IrType,
}

impl FuncSig {
    pub fn new(params: Vec<IrType>, ret: IrType) -> Self {
        Self { params, ret }
    }
}

/// Call target
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Direct(FuncId),
    Indirect { ptr: Value, sig: FuncSig },
}

/// An IR instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // ===== Memory =====
    Alloca { dest: Reg, ty: IrType, count: Option<Value> },
    Load { dest: Reg, ty: IrType, ptr: Value, volatile: bool, align: Option<u32> },
    Store { value: Value, ptr: Value, volatile: bool, align: Option<u32> },
    /// In-bounds address computation over `base_ty`
    Gep { dest: Reg, base_ty: IrType, ptr: Value, indices: Vec<Value> },
    MemSet { ptr: Value, byte: Value, len: Value, volatile: bool },
    MemCopy { dest: Value, src: Value, len: Value, volatile: bool },
    /// Compare-and-swap returning the previous value
    CmpXchg { dest: Reg, ptr: Value, expected: Value, new: Value },

    // ===== Arithmetic =====
    Binary { dest: Reg, op: BinOp, lhs: Value, rhs: Value },
    CheckedBinary { dest: Reg, overflow: Reg, op: CheckedOp, lhs: Value, rhs: Value },
    FNeg { dest: Reg, value: Value },
    ICmp { dest: Reg, pred: IntPredicate, lhs: Value, rhs: Value },
    FCmp { dest: Reg, pred: FloatPredicate, lhs: Value, rhs: Value },
    Cast { dest: Reg, op: CastOp, value: Value, ty: IrType },

    // ===== Calls =====
    Call { dest: Option<Reg>, callee: Callee, args: Vec<Value>, tail: bool },

    // ===== Exceptions =====
    /// Unwind landing: the thrown object and its type selector
    LandingPad { exn: Reg, selector: Reg, catches: Vec<GlobalId>, cleanup: bool },
}

impl Instr {
    /// Registers defined by this instruction
    pub fn defs(&self) -> Vec<Reg> {
        match self {
            Instr::Alloca { dest, .. }
            | Instr::Load { dest, .. }
            | Instr::Gep { dest, .. }
            | Instr::CmpXchg { dest, .. }
            | Instr::Binary { dest, .. }
            | Instr::FNeg { dest, .. }
            | Instr::ICmp { dest, .. }
            | Instr::FCmp { dest, .. }
            | Instr::Cast { dest, .. } => vec![*dest],
            Instr::CheckedBinary { dest, overflow, .. } => vec![*dest, *overflow],
            Instr::Call { dest, .. } => dest.iter().copied().collect(),
            Instr::LandingPad { exn, selector, .. } => vec![*exn, *selector],
            Instr::Store { .. } | Instr::MemSet { .. } | Instr::MemCopy { .. } => Vec::new(),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Instr::Call { .. })
    }
}

/// SSA join placed at the head of a block
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub dest: Reg,
    pub ty: IrType,
    pub incoming: Vec<(Value, BlockId)>,
}

/// How a block ends
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr { cond: Value, then_block: BlockId, else_block: BlockId },
    Switch { value: Value, default: BlockId, cases: Vec<(i64, BlockId)> },
    Ret(Option<Value>),
    /// Call with an unwind edge
    Invoke { dest: Option<Reg>, callee: Callee, args: Vec<Value>, normal: BlockId, unwind: BlockId },
    Resume { exn: Value, selector: Value },
    Unreachable,
    /// Not yet assigned
    None,
}

impl Terminator {
    /// Successor edges in order (duplicates preserved)
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, b)| *b));
                out
            }
            Terminator::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            Terminator::Ret(_) | Terminator::Resume { .. } | Terminator::Unreachable | Terminator::None => Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Terminator::None)
    }
}

/// A basic block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub phis: Vec<Phi>,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

/// Blocks and registers of one function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub blocks: Vec<Block>,
    /// Emission order of blocks; the first is the entry
    pub layout: Vec<BlockId>,
    reg_types: Vec<IrType>,
    param_count: u32,
}

impl FunctionBody {
    /// Empty body whose first registers are the parameters
    pub fn new(params: &[IrType]) -> Self {
        FunctionBody {
            blocks: Vec::new(),
            layout: Vec::new(),
            reg_types: params.to_vec(),
            param_count: params.len() as u32,
        }
    }

    pub fn param(&self, index: usize) -> Value {
        Value::Reg(Reg(index as u32))
    }

    pub fn param_count(&self) -> usize {
        self.param_count as usize
    }

    pub fn alloc_reg(&mut self, ty: IrType) -> Reg {
        let reg = Reg(self.reg_types.len() as u32);
        self.reg_types.push(ty);
        reg
    }

    pub fn reg_type(&self, reg: Reg) -> IrType {
        self.reg_types.get(reg.0 as usize).copied().unwrap_or(IrType::Void)
    }

    /// Type of an operand
    pub fn value_type(&self, value: &Value) -> IrType {
        match value {
            Value::Reg(r) => self.reg_type(*r),
            Value::Int { ty, .. } | Value::Float { ty, .. } | Value::Undef(ty) => *ty,
            Value::Null | Value::Global(_) | Value::Function(_) => IrType::Ptr,
        }
    }

    /// Append a block at the end of the layout
    pub fn add_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            name: name.to_string(),
            phis: Vec::new(),
            instrs: Vec::new(),
            terminator: Terminator::None,
        });
        self.layout.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn find_block(&self, name: &str) -> Option<BlockId> {
        self.blocks.iter().find(|b| b.name == name).map(|b| b.id)
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    /// Move `block` so it is laid out right after `after`
    pub fn move_after(&mut self, block: BlockId, after: BlockId) {
        self.layout.retain(|b| *b != block);
        let at = self.layout.iter().position(|b| *b == after).map(|i| i + 1).unwrap_or(self.layout.len());
        self.layout.insert(at, block);
    }

    /// Move `block` so it is laid out right before `before`
    pub fn move_before(&mut self, block: BlockId, before: BlockId) {
        self.layout.retain(|b| *b != block);
        let at = self.layout.iter().position(|b| *b == before).unwrap_or(self.layout.len());
        self.layout.insert(at, block);
    }

    /// Incoming edges of `id`, one entry per edge
    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                if succ == id {
                    preds.push(block.id);
                }
            }
        }
        preds
    }

    /// Blocks in layout order
    pub fn ordered_blocks(&self) -> impl Iterator<Item = &Block> {
        self.layout.iter().map(move |id| self.block(*id))
    }

    /// Total number of instructions across all blocks
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len() + b.phis.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_moves() {
        let mut body = FunctionBody::new(&[]);
        let a = body.add_block("a");
        let b = body.add_block("b");
        let c = body.add_block("c");
        body.move_after(a, c);
        assert_eq!(body.layout, vec![b, c, a]);
        body.move_before(a, b);
        assert_eq!(body.layout, vec![a, b, c]);
    }

    #[test]
    fn test_predecessor_edges_keep_duplicates() {
        let mut body = FunctionBody::new(&[IrType::I32]);
        let entry = body.add_block("entry");
        let target = body.add_block("target");
        let value = body.param(0);
        body.block_mut(entry).terminator = Terminator::Switch {
            value,
            default: target,
            cases: vec![(0, target)],
        };
        assert_eq!(body.predecessors(target), vec![entry, entry]);
        assert_eq!(body.value_type(&body.param(0)), IrType::I32);
    }
}
