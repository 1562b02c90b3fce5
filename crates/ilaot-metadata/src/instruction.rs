//! Instruction stream
//!
//! Each opcode family is one variant with a strongly typed payload, so the
//! lowering engine never re-inspects an untyped operand. Branch targets are
//! byte offsets into the owning method body.

use serde::{Deserialize, Serialize};

use crate::assembly::{FieldRef, MethodRef};
use crate::types::TypeRef;

/// Byte offset of an instruction inside its method body
pub type Offset = u32;

/// Operand width of `ldind.*` / `stind.*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndirectKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    I,
    R4,
    R8,
    Ref,
}

/// Element kind of `ldelem.*` / `stelem.*`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    I,
    R4,
    R8,
    Ref,
    /// `ldelem <type>` / `stelem <type>`
    Any(TypeRef),
}

/// Two-operand arithmetic and bitwise operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

/// Overflow checking requested by `*.ovf` and `*.ovf.un` variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OverflowCheck {
    #[default]
    None,
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// `ceq`, `cgt`, `cgt.un`, `clt`, `clt.un`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gt,
    GtUn,
    Lt,
    LtUn,
}

/// Condition of a two-operand conditional branch (`beq`, `bge.un`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchCondition {
    Eq,
    NeUn,
    Ge,
    GeUn,
    Gt,
    GtUn,
    Le,
    LeUn,
    Lt,
    LtUn,
}

/// Target of a `conv.*` instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvTarget {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
    /// `conv.r.un`
    RUn,
}

/// Stand-alone signature used by `calli`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSiteSig {
    pub has_this: bool,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
}

/// How control leaves an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Next,
    Branch,
    CondBranch,
    Return,
    Throw,
    /// Prefix applying to the next instruction
    Meta,
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Nop,
    Break,
    Pop,
    Dup,
    Ret,

    // ===== Constants =====
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Ldnull,
    Ldstr(String),

    // ===== Arguments and locals =====
    Ldarg(u16),
    Ldarga(u16),
    Starg(u16),
    Ldloc(u16),
    Ldloca(u16),
    Stloc(u16),

    // ===== Fields =====
    Ldfld(FieldRef),
    Ldflda(FieldRef),
    Stfld(FieldRef),
    Ldsfld(FieldRef),
    Ldsflda(FieldRef),
    Stsfld(FieldRef),

    // ===== Indirect and object memory =====
    Ldind(IndirectKind),
    Stind(IndirectKind),
    Ldobj(TypeRef),
    Stobj(TypeRef),
    Cpobj(TypeRef),
    Initobj(TypeRef),
    Sizeof(TypeRef),
    Localloc,

    // ===== Calls =====
    Call(MethodRef),
    Callvirt(MethodRef),
    Calli(CallSiteSig),
    Newobj(MethodRef),
    Ldftn(MethodRef),
    Ldvirtftn(MethodRef),

    // ===== Prefixes =====
    Constrained(TypeRef),
    Volatile,
    Unaligned(u8),
    Readonly,
    Tail,

    // ===== Object model =====
    Box(TypeRef),
    Unbox(TypeRef),
    UnboxAny(TypeRef),
    Castclass(TypeRef),
    Isinst(TypeRef),
    Ldtoken(TypeRef),

    // ===== Arrays =====
    Newarr(TypeRef),
    Ldlen,
    Ldelema(TypeRef),
    Ldelem(ElementKind),
    Stelem(ElementKind),

    // ===== Branches =====
    Br(Offset),
    Brtrue(Offset),
    Brfalse(Offset),
    Branch { cond: BranchCondition, target: Offset },
    Switch(Vec<Offset>),

    // ===== Arithmetic =====
    Compare(CompareOp),
    Binary { op: BinaryOp, overflow: OverflowCheck },
    Unary(UnaryOp),
    Conv { target: ConvTarget, overflow: OverflowCheck },

    // ===== Exceptions =====
    Throw,
    Rethrow,
    Leave(Offset),
    Endfinally,
}

impl Instruction {
    /// Control flow class of the instruction
    pub fn flow_control(&self) -> FlowControl {
        match self {
            Instruction::Br(_) | Instruction::Leave(_) => FlowControl::Branch,
            Instruction::Brtrue(_)
            | Instruction::Brfalse(_)
            | Instruction::Branch { .. }
            | Instruction::Switch(_) => FlowControl::CondBranch,
            Instruction::Ret | Instruction::Endfinally => FlowControl::Return,
            Instruction::Throw | Instruction::Rethrow => FlowControl::Throw,
            Instruction::Constrained(_)
            | Instruction::Volatile
            | Instruction::Unaligned(_)
            | Instruction::Readonly
            | Instruction::Tail => FlowControl::Meta,
            _ => FlowControl::Next,
        }
    }

    /// Explicit branch targets (empty for non-branching instructions)
    pub fn branch_targets(&self) -> Vec<Offset> {
        match self {
            Instruction::Br(t)
            | Instruction::Brtrue(t)
            | Instruction::Brfalse(t)
            | Instruction::Leave(t)
            | Instruction::Branch { target: t, .. } => vec![*t],
            Instruction::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Mutable access to every branch target, used when patching labels
    pub fn branch_targets_mut(&mut self) -> Vec<&mut Offset> {
        match self {
            Instruction::Br(t)
            | Instruction::Brtrue(t)
            | Instruction::Brfalse(t)
            | Instruction::Leave(t)
            | Instruction::Branch { target: t, .. } => vec![t],
            Instruction::Switch(targets) => targets.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Size in bytes of the canonical (long-form) encoding
    pub fn encoded_size(&self) -> u32 {
        match self {
            Instruction::LdcI4(_) | Instruction::LdcR4(_) => 5,
            Instruction::LdcI8(_) | Instruction::LdcR8(_) => 9,
            Instruction::Ldstr(_) => 5,
            Instruction::Ldarg(_)
            | Instruction::Ldarga(_)
            | Instruction::Starg(_)
            | Instruction::Ldloc(_)
            | Instruction::Ldloca(_)
            | Instruction::Stloc(_) => 4,
            Instruction::Ldfld(_)
            | Instruction::Ldflda(_)
            | Instruction::Stfld(_)
            | Instruction::Ldsfld(_)
            | Instruction::Ldsflda(_)
            | Instruction::Stsfld(_) => 5,
            Instruction::Ldobj(_)
            | Instruction::Stobj(_)
            | Instruction::Cpobj(_)
            | Instruction::Box(_)
            | Instruction::Unbox(_)
            | Instruction::UnboxAny(_)
            | Instruction::Castclass(_)
            | Instruction::Isinst(_)
            | Instruction::Ldtoken(_)
            | Instruction::Newarr(_)
            | Instruction::Ldelema(_) => 5,
            Instruction::Initobj(_) | Instruction::Sizeof(_) | Instruction::Constrained(_) => 6,
            Instruction::Localloc | Instruction::Volatile | Instruction::Readonly | Instruction::Tail => 2,
            Instruction::Unaligned(_) => 3,
            Instruction::Call(_)
            | Instruction::Callvirt(_)
            | Instruction::Calli(_)
            | Instruction::Newobj(_) => 5,
            Instruction::Ldftn(_) | Instruction::Ldvirtftn(_) => 6,
            Instruction::Ldelem(ElementKind::Any(_)) | Instruction::Stelem(ElementKind::Any(_)) => 5,
            Instruction::Br(_)
            | Instruction::Brtrue(_)
            | Instruction::Brfalse(_)
            | Instruction::Branch { .. }
            | Instruction::Leave(_) => 5,
            Instruction::Switch(targets) => 5 + 4 * targets.len() as u32,
            Instruction::Compare(_) => 2,
            Instruction::Rethrow => 2,
            _ => 1,
        }
    }

    /// Lower-case mnemonic, used in diagnostics
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Break => "break",
            Instruction::Pop => "pop",
            Instruction::Dup => "dup",
            Instruction::Ret => "ret",
            Instruction::LdcI4(_) => "ldc.i4",
            Instruction::LdcI8(_) => "ldc.i8",
            Instruction::LdcR4(_) => "ldc.r4",
            Instruction::LdcR8(_) => "ldc.r8",
            Instruction::Ldnull => "ldnull",
            Instruction::Ldstr(_) => "ldstr",
            Instruction::Ldarg(_) => "ldarg",
            Instruction::Ldarga(_) => "ldarga",
            Instruction::Starg(_) => "starg",
            Instruction::Ldloc(_) => "ldloc",
            Instruction::Ldloca(_) => "ldloca",
            Instruction::Stloc(_) => "stloc",
            Instruction::Ldfld(_) => "ldfld",
            Instruction::Ldflda(_) => "ldflda",
            Instruction::Stfld(_) => "stfld",
            Instruction::Ldsfld(_) => "ldsfld",
            Instruction::Ldsflda(_) => "ldsflda",
            Instruction::Stsfld(_) => "stsfld",
            Instruction::Ldind(_) => "ldind",
            Instruction::Stind(_) => "stind",
            Instruction::Ldobj(_) => "ldobj",
            Instruction::Stobj(_) => "stobj",
            Instruction::Cpobj(_) => "cpobj",
            Instruction::Initobj(_) => "initobj",
            Instruction::Sizeof(_) => "sizeof",
            Instruction::Localloc => "localloc",
            Instruction::Call(_) => "call",
            Instruction::Callvirt(_) => "callvirt",
            Instruction::Calli(_) => "calli",
            Instruction::Newobj(_) => "newobj",
            Instruction::Ldftn(_) => "ldftn",
            Instruction::Ldvirtftn(_) => "ldvirtftn",
            Instruction::Constrained(_) => "constrained.",
            Instruction::Volatile => "volatile.",
            Instruction::Unaligned(_) => "unaligned.",
            Instruction::Readonly => "readonly.",
            Instruction::Tail => "tail.",
            Instruction::Box(_) => "box",
            Instruction::Unbox(_) => "unbox",
            Instruction::UnboxAny(_) => "unbox.any",
            Instruction::Castclass(_) => "castclass",
            Instruction::Isinst(_) => "isinst",
            Instruction::Ldtoken(_) => "ldtoken",
            Instruction::Newarr(_) => "newarr",
            Instruction::Ldlen => "ldlen",
            Instruction::Ldelema(_) => "ldelema",
            Instruction::Ldelem(_) => "ldelem",
            Instruction::Stelem(_) => "stelem",
            Instruction::Br(_) => "br",
            Instruction::Brtrue(_) => "brtrue",
            Instruction::Brfalse(_) => "brfalse",
            Instruction::Branch { cond, .. } => match cond {
                BranchCondition::Eq => "beq",
                BranchCondition::NeUn => "bne.un",
                BranchCondition::Ge => "bge",
                BranchCondition::GeUn => "bge.un",
                BranchCondition::Gt => "bgt",
                BranchCondition::GtUn => "bgt.un",
                BranchCondition::Le => "ble",
                BranchCondition::LeUn => "ble.un",
                BranchCondition::Lt => "blt",
                BranchCondition::LtUn => "blt.un",
            },
            Instruction::Switch(_) => "switch",
            Instruction::Compare(op) => match op {
                CompareOp::Eq => "ceq",
                CompareOp::Gt => "cgt",
                CompareOp::GtUn => "cgt.un",
                CompareOp::Lt => "clt",
                CompareOp::LtUn => "clt.un",
            },
            Instruction::Binary { op, .. } => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
                BinaryOp::DivUn => "div.un",
                BinaryOp::Rem => "rem",
                BinaryOp::RemUn => "rem.un",
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
                BinaryOp::Shl => "shl",
                BinaryOp::Shr => "shr",
                BinaryOp::ShrUn => "shr.un",
            },
            Instruction::Unary(UnaryOp::Neg) => "neg",
            Instruction::Unary(UnaryOp::Not) => "not",
            Instruction::Conv { .. } => "conv",
            Instruction::Throw => "throw",
            Instruction::Rethrow => "rethrow",
            Instruction::Leave(_) => "leave",
            Instruction::Endfinally => "endfinally",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_classes() {
        assert_eq!(Instruction::Br(0).flow_control(), FlowControl::Branch);
        assert_eq!(Instruction::Leave(4).flow_control(), FlowControl::Branch);
        assert_eq!(Instruction::Switch(vec![1, 2]).flow_control(), FlowControl::CondBranch);
        assert_eq!(Instruction::Volatile.flow_control(), FlowControl::Meta);
        assert_eq!(Instruction::Rethrow.flow_control(), FlowControl::Throw);
        assert_eq!(Instruction::LdcI4(1).flow_control(), FlowControl::Next);
    }

    #[test]
    fn test_branch_target_patching() {
        let mut instr = Instruction::Switch(vec![0, 1]);
        for t in instr.branch_targets_mut() {
            *t += 10;
        }
        assert_eq!(instr.branch_targets(), vec![10, 11]);
        assert_eq!(instr.encoded_size(), 13);
    }
}
